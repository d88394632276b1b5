//! Session-id swapping in URL paths and JSON bodies.
//!
//! The client only ever sees its own session id; Selenium only ever sees
//! the id it assigned. Both directions go through these helpers.

use serde_json::Value;

/// The client-visible session id embedded in a WebDriver path, if any:
/// the segment following `session`.
pub fn session_id_from_path(path: &str) -> Option<i64> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "session" {
            return segments.next()?.parse().ok();
        }
    }
    None
}

/// Replace the id segment following `session` in `path`.
pub fn set_path_session_id(path: &str, id: &str) -> String {
    let mut out = Vec::new();
    let mut replace_next = false;
    for segment in path.split('/') {
        if replace_next && !segment.is_empty() {
            out.push(id.to_string());
            replace_next = false;
            continue;
        }
        if segment == "session" {
            replace_next = true;
        }
        out.push(segment.to_string());
    }
    out.join("/")
}

/// Replace a top-level `sessionId` key in a JSON body. Non-JSON bodies and
/// bodies without the key pass through untouched.
pub fn set_body_session_id(body: &[u8], id: &str) -> Vec<u8> {
    if body.is_empty() {
        return Vec::new();
    }
    let Ok(mut parsed) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    let Some(object) = parsed.as_object_mut() else {
        return body.to_vec();
    };
    if !object.contains_key("sessionId") {
        return body.to_vec();
    }
    object.insert("sessionId".to_string(), Value::String(id.to_string()));
    serde_json::to_vec(&parsed).unwrap_or_else(|_| body.to_vec())
}

pub fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

fn second_last_segment(path: &str) -> &str {
    let mut segments = path.trim_end_matches('/').rsplit('/');
    segments.next();
    segments.next().unwrap_or_default()
}

/// `POST …/session`: the create-session flow.
pub fn is_create_session(method: &str, path: &str) -> bool {
    method == "POST" && last_segment(path) == "session"
}

/// `DELETE …/session/<id>`: the close-session flow.
pub fn is_delete_session(method: &str, path: &str) -> bool {
    method == "DELETE" && second_last_segment(path) == "session"
}

/// Commands worth a screenshot: navigation, clicks, script execution and
/// keystrokes, judged on the final path segment only.
pub fn wants_screenshot(method: &str, path: &str) -> bool {
    method == "POST"
        && matches!(last_segment(path), "url" | "click" | "execute" | "keys")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_session_id() {
        assert_eq!(session_id_from_path("/wd/hub/session/17/url"), Some(17));
        assert_eq!(session_id_from_path("/wd/hub/session/17"), Some(17));
        assert_eq!(session_id_from_path("/wd/hub/session"), None);
        assert_eq!(session_id_from_path("/wd/hub/status"), None);
        assert_eq!(session_id_from_path("/wd/hub/session/UP123/url"), None);
    }

    #[test]
    fn swaps_path_id_both_ways() {
        assert_eq!(
            set_path_session_id("/wd/hub/session/17/element/0/click", "UP123"),
            "/wd/hub/session/UP123/element/0/click"
        );
        assert_eq!(
            set_path_session_id("/wd/hub/session/UP123/url", "17"),
            "/wd/hub/session/17/url"
        );
        // no id segment: unchanged
        assert_eq!(set_path_session_id("/wd/hub/status", "17"), "/wd/hub/status");
    }

    #[test]
    fn swaps_body_id_and_preserves_the_rest() {
        let body = json!({"sessionId": "UP123", "status": 0, "value": {"x": 1}});
        let out = set_body_session_id(&serde_json::to_vec(&body).unwrap(), "17");
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["sessionId"], "17");
        assert_eq!(parsed["status"], 0);
        assert_eq!(parsed["value"]["x"], 1);
    }

    #[test]
    fn leaves_foreign_bodies_alone() {
        assert_eq!(set_body_session_id(b"not json", "17"), b"not json");
        assert_eq!(
            set_body_session_id(br#"{"status":0}"#, "17"),
            br#"{"status":0}"#
        );
        assert!(set_body_session_id(b"", "17").is_empty());
    }

    #[test]
    fn classifies_routes() {
        assert!(is_create_session("POST", "/wd/hub/session"));
        assert!(!is_create_session("GET", "/wd/hub/session"));
        assert!(!is_create_session("POST", "/wd/hub/session/1/url"));

        assert!(is_delete_session("DELETE", "/wd/hub/session/1"));
        assert!(!is_delete_session("DELETE", "/wd/hub/session/1/cookie"));
        assert!(!is_delete_session("POST", "/wd/hub/session/1"));
    }

    #[test]
    fn screenshot_heuristic_is_last_segment_only() {
        assert!(wants_screenshot("POST", "/wd/hub/session/1/url"));
        assert!(wants_screenshot("POST", "/wd/hub/session/1/element/3/click"));
        assert!(wants_screenshot("POST", "/wd/hub/session/1/execute"));
        assert!(wants_screenshot("POST", "/wd/hub/session/1/element/3/keys"));

        assert!(!wants_screenshot("GET", "/wd/hub/session/1/url"));
        assert!(!wants_screenshot("POST", "/wd/hub/session/1/url/extra"));
        assert!(!wants_screenshot("POST", "/wd/hub/session/1/cookie"));
    }
}
