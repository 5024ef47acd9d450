//! Metrics and ACL diagnostics publication.

use std::time::{SystemTime, UNIX_EPOCH};

use pathspace_space::PathValue;
use pathspace_wire::AuthContext;

use crate::ServerOptions;

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

fn metrics_base(options: &ServerOptions, alias: &str) -> String {
    let mut path = if options.metrics_root.is_empty() {
        "/inspector/metrics/remotes".to_string()
    } else {
        options.metrics_root.clone()
    };
    if !path.ends_with('/') {
        path.push('/');
    }
    if alias.is_empty() {
        path.push('_');
    } else {
        path.push_str(alias);
    }
    path
}

/// Replace the metric value at `<metrics_root>/<alias>/<suffix>`.
pub fn publish_metric<T: PathValue>(
    options: &ServerOptions,
    alias: &str,
    suffix: &str,
    value: &T,
) {
    let Some(space) = &options.metrics_space else {
        return;
    };
    let mut path = metrics_base(options, alias);
    if !suffix.is_empty() {
        if !suffix.starts_with('/') {
            path.push('/');
        }
        path.push_str(suffix);
    }
    let _ = space.replace(&path, value);
}

/// Append a timestamped ACL diagnostic record under
/// `<diagnostics_root>/<alias>/events/<unix_ms>`.
pub fn record_diagnostic(
    options: &ServerOptions,
    alias: &str,
    code: &str,
    message: &str,
    auth: &AuthContext,
) {
    let Some(space) = &options.diagnostics_space else {
        return;
    };
    let mut root = if options.diagnostics_root.is_empty() {
        "/diagnostics/web/inspector/acl".to_string()
    } else {
        options.diagnostics_root.clone()
    };
    if !root.ends_with('/') {
        root.push('/');
    }
    if alias.is_empty() {
        root.push('_');
    } else {
        root.push_str(alias);
    }
    root.push_str("/events/");
    root.push_str(&format!("{:020}", current_time_ms()));

    let mut payload = serde_json::json!({
        "code": code,
        "message": message,
        "subject": auth.subject,
        "audience": auth.audience,
    });
    if !auth.fingerprint.is_empty() {
        payload["fingerprint"] = auth.fingerprint.clone().into();
    }
    if !auth.proof.is_empty() {
        payload["proof"] = auth.proof.clone().into();
    }
    let _ = space.insert(&root, &payload.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathspace_space::PathSpace;
    use std::sync::Arc;

    #[test]
    fn test_publish_metric_replaces() {
        let metrics = PathSpace::new();
        let options = ServerOptions {
            metrics_space: Some(Arc::clone(&metrics)),
            ..ServerOptions::default()
        };
        publish_metric(&options, "demo", "server/sessions/active", &1i64);
        publish_metric(&options, "demo", "server/sessions/active", &2i64);
        let value: i64 = metrics
            .read("/inspector/metrics/remotes/demo/server/sessions/active")
            .expect("metric");
        assert_eq!(value, 2);
    }

    #[test]
    fn test_publish_metric_without_space_is_noop() {
        let options = ServerOptions::default();
        publish_metric(&options, "demo", "anything", &1i64);
    }

    #[test]
    fn test_record_diagnostic_appends_event() {
        let diagnostics = PathSpace::new();
        let options = ServerOptions {
            diagnostics_space: Some(Arc::clone(&diagnostics)),
            diagnostics_root: "/diag/acl".to_string(),
            ..ServerOptions::default()
        };
        let auth = AuthContext {
            subject: "CN=client".into(),
            proof: "sha256:ab".into(),
            fingerprint: "sha256:ab".into(),
            ..AuthContext::default()
        };
        record_diagnostic(&options, "demo", "mount_open", "session accepted", &auth);
        let events = diagnostics.list_children("/diag/acl/demo/events");
        assert_eq!(events.len(), 1);
        let record: String = diagnostics
            .read(&format!("/diag/acl/demo/events/{}", events[0]))
            .expect("event");
        let parsed: serde_json::Value = serde_json::from_str(&record).expect("json");
        assert_eq!(parsed["code"], "mount_open");
        assert_eq!(parsed["subject"], "CN=client");
        assert_eq!(parsed["proof"], "sha256:ab");
    }
}
