//! Built-in specialist agents and the keyword routes that reach them.
//!
//! Configs leave `model` empty so registration fills in `[llm].model`.
//! Tool handlers for the declared tools are supplied by the embedding
//! application through [`AgentRegistry::register_tool`].

use serde_json::json;
use syncso_core::domain::agent::{AgentConfig, AgentId, ToolSpec};
use syncso_core::errors::AgentError;

use crate::registry::AgentRegistry;
use crate::router::AgentRoute;

pub const LEARN: &str = "learn";
pub const GROWTH: &str = "growth";
pub const SENTINEL: &str = "sentinel";
pub const FINANCE: &str = "finance";
pub const RAISE: &str = "raise";
pub const CREATE: &str = "create";

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    prompt: &'static str,
    temperature: Option<f32>,
    capabilities: &'static [&'static str],
    keywords: &'static [&'static str],
}

const ENTRIES: &[CatalogEntry] = &[
    CatalogEntry {
        id: LEARN,
        name: "Learn Agent",
        description: "Learning & development, course recommendations, skill tracking, AI tutoring",
        prompt: "You are the Learn agent for iSyncSO. Recommend courses, track skill progress and tutor \
                 users through new topics. Keep explanations practical and suggest concrete next steps.",
        temperature: None,
        capabilities: &["Course recommendations", "Skill tracking", "AI tutoring", "Learning paths"],
        keywords: &["learn", "course", "training", "skill", "tutor", "lesson", "study", "teach"],
    },
    CatalogEntry {
        id: GROWTH,
        name: "Growth Agent",
        description: "Sales pipeline, prospect research, lead scoring, campaign automation",
        prompt: "You are the Growth agent for iSyncSO. Research prospects and companies, score leads, \
                 manage the sales pipeline and plan outreach campaigns. Be specific about sources and next actions.",
        temperature: None,
        capabilities: &["Prospect research", "Lead scoring", "Pipeline management", "Campaign automation"],
        keywords: &[
            "research", "prospect", "lead", "pipeline", "campaign", "outreach", "sales", "company",
            "email", "crm",
        ],
    },
    CatalogEntry {
        id: SENTINEL,
        name: "Compliance Agent",
        description: "EU AI Act compliance, risk assessment, governance documentation",
        prompt: "You are the Sentinel compliance agent for iSyncSO. Classify AI systems under the EU AI Act, \
                 assess risk, track obligations and deadlines, and produce governance documentation. \
                 Cite the applicable articles and prioritize by risk and deadline.",
        temperature: Some(0.3),
        capabilities: &[
            "AI system classification",
            "Risk assessment",
            "Compliance monitoring",
            "Obligation tracking",
            "Report generation",
        ],
        keywords: &["compliance", "compliant", "risk", "regulation", "governance", "audit", "gdpr"],
    },
    CatalogEntry {
        id: FINANCE,
        name: "Finance Agent",
        description: "Invoice processing, expense tracking, budget forecasting",
        prompt: "You are the Finance agent for iSyncSO. Create proposals and invoices, calculate pricing \
                 including Dutch BTW (21%), track expenses and forecast budgets. Show your calculations.",
        temperature: Some(0.6),
        capabilities: &[
            "Proposal creation",
            "Pricing calculation",
            "Invoice processing",
            "Expense tracking",
            "Budget forecasting",
        ],
        keywords: &["invoice", "expense", "budget", "forecast", "proposal", "pricing", "quote", "payment", "finance"],
    },
    CatalogEntry {
        id: RAISE,
        name: "Raise Agent",
        description: "Fundraising, investor research, pitch preparation, deal pipeline",
        prompt: "You are the Raise agent for iSyncSO. Help founders fundraise: research investors, prepare \
                 pitches and manage the deal pipeline. Be candid about fit and timing.",
        temperature: None,
        capabilities: &["Investor research", "Pitch preparation", "Deal pipeline", "Fundraising strategy"],
        keywords: &["investor", "fundraise", "fundraising", "pitch", "funding", "vc", "round", "deck"],
    },
    CatalogEntry {
        id: CREATE,
        name: "Create Agent",
        description: "AI image generation, marketing creatives, product visuals",
        prompt: "You are the Create agent for iSyncSO. Produce image prompts, marketing creatives and \
                 product visuals that fit the brand. Describe the composition you intend before generating.",
        temperature: None,
        capabilities: &["Image generation", "Marketing creatives", "Product visuals"],
        keywords: &["image", "visual", "creative", "design", "banner", "logo", "illustration", "photo"],
    },
];

fn finance_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "create_proposal",
            "Create a new proposal with pricing and optional template.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "client": { "type": "object" },
                    "template_id": { "type": "string" },
                    "line_items": { "type": "array" },
                    "discount_percent": { "type": "number" },
                    "valid_days": { "type": "integer" }
                },
                "required": ["title", "client", "line_items"]
            }),
        ),
        ToolSpec::new(
            "send_proposal",
            "Send a proposal to the client.",
            json!({
                "type": "object",
                "properties": {
                    "proposal_id": { "type": "string" },
                    "recipient_email": { "type": "string" },
                    "message": { "type": "string" }
                },
                "required": ["proposal_id"]
            }),
        ),
    ]
}

fn sentinel_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "classify_system",
            "Classify an AI system under the EU AI Act risk tiers.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "purpose": { "type": "string" },
                    "domain": { "type": "string" }
                },
                "required": ["name", "purpose"]
            }),
        ),
        ToolSpec::new(
            "assess_risk",
            "Run a risk assessment for a registered AI system.",
            json!({
                "type": "object",
                "properties": {
                    "system_id": { "type": "string" },
                    "risk_level": {
                        "type": "string",
                        "enum": ["unacceptable", "high", "limited", "minimal"]
                    }
                },
                "required": ["system_id"]
            }),
        ),
    ]
}

/// The six platform specialists, unregistered.
pub fn builtin_agents() -> Vec<AgentConfig> {
    ENTRIES
        .iter()
        .map(|entry| {
            let mut config = AgentConfig::new(entry.id, "", entry.prompt)
                .with_description(entry.description);
            config.name = entry.name.to_string();
            config.temperature = entry.temperature;
            config.capabilities = entry.capabilities.iter().map(|c| c.to_string()).collect();
            config.tools = match entry.id {
                FINANCE => finance_tools(),
                SENTINEL => sentinel_tools(),
                _ => Vec::new(),
            };
            config
        })
        .collect()
}

pub fn builtin_routes() -> Vec<AgentRoute> {
    ENTRIES.iter().map(|entry| AgentRoute::new(entry.id, entry.keywords)).collect()
}

pub fn builtin_ids() -> Vec<AgentId> {
    ENTRIES.iter().map(|entry| AgentId::from(entry.id)).collect()
}

/// Registers every built-in agent, returning how many were added.
pub fn register_builtin(registry: &AgentRegistry) -> Result<usize, AgentError> {
    let agents = builtin_agents();
    let count = agents.len();
    for config in agents {
        registry.register(config)?;
    }
    Ok(count)
}
