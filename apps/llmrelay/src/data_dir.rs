pub(crate) fn resolve_data_dir(cli_value: Option<&str>) -> String {
    if let Some(value) = cli_value
        && !value.trim().is_empty()
    {
        return value.to_string();
    }
    if let Ok(value) = std::env::var("LLMRELAY_DATA_DIR")
        && !value.trim().is_empty()
    {
        return value;
    }
    "./data".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_value_wins_over_default() {
        assert_eq!(resolve_data_dir(Some("/srv/data")), "/srv/data");
    }

    #[test]
    fn blank_cli_value_falls_through_to_default() {
        assert_eq!(resolve_data_dir(Some("  ")), "./data");
    }
}
