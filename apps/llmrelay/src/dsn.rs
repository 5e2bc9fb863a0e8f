//! Sqlite DSN defaulting and first-use file creation — a provider's base
//! URL and an operator's DSN are the same class of "external address that
//! may not exist yet" problem.

use std::fs::OpenOptions;
use std::path::PathBuf;

pub(crate) fn resolve_dsn(input: Option<&str>, data_dir: &str) -> anyhow::Result<String> {
    if let Some(input) = input
        && !input.trim().is_empty()
    {
        ensure_sqlite_dsn(input)?;
        return Ok(input.to_string());
    }

    let db_path = PathBuf::from(data_dir).join("db").join("llmrelay.db");
    let db_path = db_path.to_string_lossy();
    let dsn = if db_path.starts_with('/') {
        format!("sqlite:///{}", db_path.trim_start_matches('/'))
    } else {
        format!("sqlite://{db_path}")
    };
    ensure_sqlite_dsn(&dsn)?;
    Ok(dsn)
}

pub(crate) fn ensure_sqlite_dsn(dsn: &str) -> anyhow::Result<()> {
    if !dsn.starts_with("sqlite:") {
        return Ok(());
    }

    let mut rest = &dsn["sqlite:".len()..];
    if let Some(stripped) = rest.strip_prefix("//") {
        rest = stripped;
    }
    if rest.is_empty() || rest.starts_with(":memory:") || rest.starts_with("memory:") {
        return Ok(());
    }

    let path_part = rest.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }

    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_dsn_needs_no_file() {
        ensure_sqlite_dsn("sqlite::memory:").unwrap();
    }

    #[test]
    fn non_sqlite_dsn_is_a_no_op() {
        ensure_sqlite_dsn("postgres://localhost/db").unwrap();
    }
}
