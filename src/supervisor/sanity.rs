//! Result sanity checks.
//!
//! A misconfigured or unauthenticated child sometimes "succeeds" by returning
//! the arguments it was called with instead of real output. Those payloads
//! look valid to the caller, so each check here inspects a decoded result and
//! names the problem. Checks are pluggable: the façade runs whatever list it
//! was given.

/// A predicate over a tool call's result.
pub trait ResponseCheck: Send + Sync {
    /// Stable name reported in errors.
    fn name(&self) -> &str;

    /// Return `Some(reason)` if the result should be rejected.
    ///
    /// `arguments` holds every argument shape the call went through (for an
    /// aliased tool: the caller's original and the reshaped form).
    fn inspect(
        &self,
        tool: &str,
        arguments: &[&serde_json::Value],
        result: &serde_json::Value,
    ) -> Option<String>;
}

/// Flags results whose text reproduces the call arguments.
///
/// Two signals, both requiring a non-empty argument object:
/// - the text contains the compact JSON serialization of the arguments
/// - the text is itself a JSON object holding every argument key with the
///   same value and nothing else beyond [`ECHO_MARKERS`]
///
/// A lookup that returns the requested key alongside real fields (for
/// example `{"id": "42", "displayName": "Ada"}` for `{"id": "42"}`) passes.
///
/// Bare keywords such as "method" or "path" in the text do not trigger it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoedArgumentsCheck;

/// Keys a stub or mock server adds around echoed arguments.
pub const ECHO_MARKERS: &[&str] = &["mock", "method", "echo", "arguments", "params", "tool"];

impl ResponseCheck for EchoedArgumentsCheck {
    fn name(&self) -> &str {
        "echoed-arguments"
    }

    fn inspect(
        &self,
        _tool: &str,
        arguments: &[&serde_json::Value],
        result: &serde_json::Value,
    ) -> Option<String> {
        let text = result_text(result);
        let parsed = serde_json::from_str::<serde_json::Value>(text.trim()).ok();

        for args in arguments {
            let Some(arg_obj) = args.as_object().filter(|o| !o.is_empty()) else {
                continue;
            };

            if let Ok(compact) = serde_json::to_string(args) {
                if text.contains(&compact) {
                    return Some("result contains the serialized call arguments".into());
                }
            }

            if let Some(echo) = parsed.as_ref().and_then(|v| v.as_object()) {
                let mirrors = arg_obj.iter().all(|(k, v)| echo.get(k) == Some(v));
                let nothing_else = echo
                    .keys()
                    .all(|k| arg_obj.contains_key(k) || ECHO_MARKERS.contains(&k.as_str()));
                if mirrors && nothing_else {
                    return Some("result mirrors every call argument".into());
                }
            }
        }
        None
    }
}

/// Extract the human-readable text of a tool result.
///
/// Joins `content[].text` for tool-protocol results; strings are returned
/// as-is; anything else is serialized.
pub fn result_text(result: &serde_json::Value) -> String {
    if let Some(items) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
