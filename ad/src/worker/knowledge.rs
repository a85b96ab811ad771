//! Worker prompt augmentation and domain policing
//!
//! Every worker prompt carries the mandatory coding-standards block, the
//! domain whitelist, an API-knowledge block filtered by task keywords, and
//! optionally previously successful API patterns retrieved from RAG.
//! Worker output is scanned for URLs outside the whitelist.

use std::sync::LazyLock;

use regex::Regex;

/// Mandatory block prepended to every worker task
const CODING_STANDARDS: &str = "\
Coding standards (mandatory):
- Never hardcode credentials; read them from the environment.
- Prefer official APIs over scraping.
- Report numbers with their units and retrieval time.
- On tool failure, report the failure; never fabricate data.";

/// Hosts workers may reach. Subdomains of an entry are allowed.
const DOMAIN_WHITELIST: &[&str] = &[
    "api.coingecko.com",
    "api.alternative.me",
    "api.etherscan.io",
    "api.telegram.org",
    "api.github.com",
    "github.com",
    "api.twitter.com",
];

struct ApiEntry {
    keywords: &'static [&'static str],
    name: &'static str,
    notes: &'static str,
}

/// Registry of API knowledge, filtered into the prompt by task keywords
const API_KNOWLEDGE: &[ApiEntry] = &[
    ApiEntry {
        keywords: &["price", "market"],
        name: "coingecko",
        notes: "GET api.coingecko.com/api/v3/simple/price?ids=<id>&vs_currencies=usd (no auth, 30 req/min)",
    },
    ApiEntry {
        keywords: &["fear", "greed"],
        name: "alternative.me",
        notes: "GET api.alternative.me/fng/ returns {data:[{value}]} (no auth)",
    },
    ApiEntry {
        keywords: &["balance", "treasury", "holders"],
        name: "etherscan",
        notes: "GET api.etherscan.io/api?module=account&action=balance&address=<addr> (key in ETHERSCAN_KEY)",
    },
    ApiEntry {
        keywords: &["telegram", "members"],
        name: "telegram",
        notes: "GET api.telegram.org/bot<token>/getChatMemberCount?chat_id=<id>",
    },
    ApiEntry {
        keywords: &["issue", "pull", "github"],
        name: "github",
        notes: "Use the github tool server; raw api.github.com calls need GH_TOKEN",
    },
];

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://([A-Za-z0-9][A-Za-z0-9.-]*)").unwrap());

/// API-knowledge block for a task, empty when no keyword matches
fn api_knowledge_for(task_text: &str) -> String {
    let task = task_text.to_lowercase();
    let lines: Vec<String> = API_KNOWLEDGE
        .iter()
        .filter(|entry| entry.keywords.iter().any(|k| task.contains(k)))
        .map(|entry| format!("- {}: {}", entry.name, entry.notes))
        .collect();
    if lines.is_empty() {
        String::new()
    } else {
        format!("Known APIs for this task:\n{}", lines.join("\n"))
    }
}

/// Assemble the full worker prompt
pub fn augment_task(task_text: &str, dry_run: bool, rag_patterns: Option<&str>) -> String {
    let mut sections = vec![CODING_STANDARDS.to_string()];

    sections.push(format!(
        "Allowed domains (all other hosts are off limits):\n{}",
        DOMAIN_WHITELIST
            .iter()
            .map(|d| format!("- {}", d))
            .collect::<Vec<_>>()
            .join("\n")
    ));

    let knowledge = api_knowledge_for(task_text);
    if !knowledge.is_empty() {
        sections.push(knowledge);
    }

    if let Some(patterns) = rag_patterns.filter(|p| !p.is_empty()) {
        sections.push(format!("Previously successful API patterns:\n{}", patterns));
    }

    if dry_run {
        sections.push(
            "DRY RUN: perform reads normally, but simulate every write and say what you would have written."
                .to_string(),
        );
    }

    sections.push(format!("Task:\n{}", task_text));
    sections.join("\n\n")
}

/// Hosts in `output` that are not covered by the whitelist
pub fn find_blocked_domains(output: &str) -> Vec<String> {
    let mut blocked: Vec<String> = URL_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_lowercase()))
        .filter(|host| {
            !DOMAIN_WHITELIST
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
        })
        .collect();
    blocked.sort();
    blocked.dedup();
    blocked
}
