//! Static cost lookup: `(model, usage snapshot) -> cost breakdown`. No I/O —
//! the table is a compile-time literal, matched by the same trailing-`*`
//! prefix rule the format translator uses for model whitelists, so a single
//! entry like `claude-sonnet-4-*` prices every dated snapshot without
//! enumerating each one.

use std::collections::HashMap;
use std::sync::LazyLock;

use llmrelay_transform::UsageAccumulator;

/// USD cost per token, not per million — callers pass raw token counts and
/// get back dollars directly. Internally these are per-million-token rates
/// divided down, matching how vendors publish their price sheets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTable {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_create_per_million: f64,
    pub cache_read_per_million: f64,
    pub ephemeral_5m_per_million: f64,
    pub ephemeral_1h_per_million: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_create: f64,
    pub cache_read: f64,
    pub ephemeral_5m: f64,
    pub ephemeral_1h: f64,
    pub total: f64,
    pub has_pricing: bool,
}

static PRICE_TABLE: LazyLock<HashMap<&'static str, PriceTable>> = LazyLock::new(|| {
    HashMap::from([
        (
            "claude-opus-*",
            PriceTable {
                input_per_million: 15.0,
                output_per_million: 75.0,
                cache_create_per_million: 18.75,
                cache_read_per_million: 1.5,
                ephemeral_5m_per_million: 18.75,
                ephemeral_1h_per_million: 30.0,
            },
        ),
        (
            "claude-sonnet-4-*",
            PriceTable {
                input_per_million: 3.0,
                output_per_million: 15.0,
                cache_create_per_million: 3.75,
                cache_read_per_million: 0.3,
                ephemeral_5m_per_million: 3.75,
                ephemeral_1h_per_million: 6.0,
            },
        ),
        (
            "claude-haiku-*",
            PriceTable {
                input_per_million: 0.8,
                output_per_million: 4.0,
                cache_create_per_million: 1.0,
                cache_read_per_million: 0.08,
                ephemeral_5m_per_million: 1.0,
                ephemeral_1h_per_million: 1.6,
            },
        ),
        (
            "gpt-4o*",
            PriceTable {
                input_per_million: 2.5,
                output_per_million: 10.0,
                cache_create_per_million: 0.0,
                cache_read_per_million: 1.25,
                ephemeral_5m_per_million: 0.0,
                ephemeral_1h_per_million: 0.0,
            },
        ),
        (
            "gpt-4o-mini*",
            PriceTable {
                input_per_million: 0.15,
                output_per_million: 0.6,
                cache_create_per_million: 0.0,
                cache_read_per_million: 0.075,
                ephemeral_5m_per_million: 0.0,
                ephemeral_1h_per_million: 0.0,
            },
        ),
        (
            "gemini-2.5-pro*",
            PriceTable {
                input_per_million: 1.25,
                output_per_million: 10.0,
                cache_create_per_million: 0.0,
                cache_read_per_million: 0.31,
                ephemeral_5m_per_million: 0.0,
                ephemeral_1h_per_million: 0.0,
            },
        ),
        (
            "gemini-2.5-flash*",
            PriceTable {
                input_per_million: 0.3,
                output_per_million: 2.5,
                cache_create_per_million: 0.0,
                cache_read_per_million: 0.075,
                ephemeral_5m_per_million: 0.0,
                ephemeral_1h_per_million: 0.0,
            },
        ),
    ])
});

/// Finds the best table entry for `model`: an exact key wins outright;
/// otherwise the longest `*`-suffixed prefix that matches wins (so
/// `claude-sonnet-4-*` beats a hypothetical broader `claude-*` for the same
/// model name).
fn lookup(model: &str) -> Option<&'static PriceTable> {
    if let Some(table) = PRICE_TABLE.get(model) {
        return Some(table);
    }
    PRICE_TABLE
        .iter()
        .filter_map(|(pattern, table)| pattern.strip_suffix('*').map(|prefix| (prefix, table)))
        .filter(|(prefix, _)| model.starts_with(*prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, table)| table)
}

fn rate(tokens: u64, per_million: f64) -> f64 {
    tokens as f64 * per_million / 1_000_000.0
}

/// Computes the cost breakdown for a model/usage pair. A model absent from
/// the table returns all-zero costs with `has_pricing: false` — never an
/// error, since pricing is informational and must never fail a dispatch.
pub fn calculate(model: &str, usage: &UsageAccumulator) -> CostBreakdown {
    let Some(table) = lookup(model) else {
        return CostBreakdown { has_pricing: false, ..Default::default() };
    };

    let input = rate(usage.input_tokens, table.input_per_million);
    let output = rate(usage.output_tokens, table.output_per_million);
    let cache_create = rate(usage.cache_creation_input_tokens, table.cache_create_per_million);
    let cache_read = rate(usage.cache_read_input_tokens, table.cache_read_per_million);
    // Ephemeral cache-write tiers (5-minute / 1-hour TTL) share the same
    // cache-creation token count; vendors that bill them distinguish by
    // which TTL the client requested, which this accumulator doesn't carry,
    // so both are reported at zero unless a future accumulator field feeds them.
    let ephemeral_5m = 0.0;
    let ephemeral_1h = 0.0;

    CostBreakdown {
        input,
        output,
        cache_create,
        cache_read,
        ephemeral_5m,
        ephemeral_1h,
        total: input + output + cache_create + cache_read + ephemeral_5m + ephemeral_1h,
        has_pricing: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_prefix_matches_and_computes_cost() {
        let usage = UsageAccumulator { input_tokens: 1_000_000, output_tokens: 1_000_000, ..Default::default() };
        let breakdown = calculate("claude-sonnet-4-20250514", &usage);
        assert!(breakdown.has_pricing);
        assert_eq!(breakdown.input, 3.0);
        assert_eq!(breakdown.output, 15.0);
        assert_eq!(breakdown.total, 18.0);
    }

    #[test]
    fn unknown_model_has_no_pricing() {
        let usage = UsageAccumulator::default();
        let breakdown = calculate("some-unlisted-model", &usage);
        assert!(!breakdown.has_pricing);
        assert_eq!(breakdown.total, 0.0);
    }

    #[test]
    fn longest_prefix_wins_over_shorter_overlapping_prefix() {
        let usage = UsageAccumulator { input_tokens: 1_000_000, ..Default::default() };
        let mini = calculate("gpt-4o-mini-2024-07-18", &usage);
        let full = calculate("gpt-4o-2024-08-06", &usage);
        assert_eq!(mini.input, 0.15);
        assert_eq!(full.input, 2.5);
    }

    #[test]
    fn zero_usage_yields_zero_cost_but_still_has_pricing() {
        let usage = UsageAccumulator::default();
        let breakdown = calculate("gemini-2.5-flash-001", &usage);
        assert!(breakdown.has_pricing);
        assert_eq!(breakdown.total, 0.0);
    }
}
