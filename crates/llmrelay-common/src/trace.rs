/// Generates a fresh UUIDv4 trace id, lowercase 8-4-4-4-12 hex, for a single
/// upstream attempt. Echoed as `X-Trace-ID` and used to join metadata with body.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_is_v4() {
        let id = new_trace_id();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }
}
