//! Passive fact extraction from worker results
//!
//! Worker results often carry volatile numbers (prices, balances, member
//! counts) that the team wants fresh without paying for an LLM run. Fixed
//! regexes keyed by task-text keywords pull them into well-known state keys.

use std::sync::LazyLock;

use regex::Regex;

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*([0-9][\d,]*(?:\.\d+)?)").unwrap());

static FEAR_GREED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)fear\s*(?:&|and)?\s*greed(?:\s*index)?\D{0,10}(\d{1,3})").unwrap()
});

static BALANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:balance|treasury)\D{0,10}\$?\s*([0-9][\d,]*(?:\.\d+)?)").unwrap()
});

static HOLDERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d,]+)\s*holders?|holders?\D{0,5}([\d,]+)").unwrap());

static MEMBERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d,]+)\s*members?|members?\D{0,5}([\d,]+)").unwrap());

fn first_group(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().replace(',', ""))
    })
}

/// Extract `(state_key, value)` facts from a worker result. The task text
/// selects which extractors run; the result text is what they scan.
pub fn extract_worker_facts(task_text: &str, result_text: &str) -> Vec<(String, String)> {
    let task = task_text.to_lowercase();
    let mut facts = Vec::new();

    if task.contains("price") || task.contains("market") {
        if let Some(value) = first_group(&PRICE_RE, result_text) {
            facts.push(("market_price".to_string(), value));
        }
    }
    if task.contains("fear") && task.contains("greed") {
        if let Some(value) = first_group(&FEAR_GREED_RE, result_text) {
            facts.push(("fear_greed_index".to_string(), value));
        }
    }
    if task.contains("balance") || task.contains("treasury") {
        if let Some(value) = first_group(&BALANCE_RE, result_text) {
            facts.push(("treasury_balance".to_string(), value));
        }
    }
    if task.contains("holders") {
        if let Some(value) = first_group(&HOLDERS_RE, result_text) {
            facts.push(("holder_count".to_string(), value));
        }
    }
    if task.contains("telegram") && task.contains("members") {
        if let Some(value) = first_group(&MEMBERS_RE, result_text) {
            facts.push(("telegram_members".to_string(), value));
        }
    }

    facts
}
