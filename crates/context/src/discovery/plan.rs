//! Discovery step plan
//!
//! The plan is plain data: an ordered list of [`StepDescriptor`]s. The
//! orchestrator walks it without knowing what each step means.

use serde::Serialize;

/// Where a step looks for new sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalPolicy {
    /// Knowledge base retrieval for the query plus up to `terms` search terms
    KnowledgeBase { terms: usize },
    /// Web and encyclopedia lookups for the query plus up to `terms` search terms
    Web { terms: usize },
    /// Knowledge base and web for the query only
    Combined,
    /// Synthesis over what the run has accumulated
    None,
}

/// One entry of the plan
#[derive(Debug, Clone, Serialize)]
pub struct StepDescriptor {
    pub name: &'static str,
    pub retrieval: RetrievalPolicy,
    /// Synthesis prompt with `{query}`, `{findings}` and `{documents}` slots
    #[serde(skip)]
    pub template: &'static str,
    /// Skipped (completed with a note) when its sources are disabled for the run
    pub skippable: bool,
    /// Synthesis ends with a `SEARCH TERMS:` line stored on the run
    pub extracts_terms: bool,
}

impl StepDescriptor {
    pub fn render(&self, query: &str, findings: &str, documents: &str) -> String {
        fill(self.template, query, findings, documents)
    }
}

const ANALYSIS_TEMPLATE: &str = "Analyze this geospatial research query and plan the investigation.

Query: {query}

Knowledge base excerpts:
{documents}
Cover:
1. Key geospatial concepts and terms
2. Geographic locations or regions involved
3. Type of spatial analysis required, if any
4. Data sources that should be consulted
5. Applicable GIS tools or methods
6. Recommended research approach

Cite excerpts as [citation:X] where they support a point.
Finish with one line of the form:
SEARCH TERMS: term one, term two, term three";

const KNOWLEDGE_BASE_TEMPLATE: &str = "Review these knowledge base findings for the research query: {query}

Findings so far:
{findings}

Retrieved documents:
{documents}
Summarize what the knowledge base establishes, with [citation:X] markers, and note what it leaves open.";

const WEB_TEMPLATE: &str = "Review these web and encyclopedia results for the research query: {query}

Findings so far:
{findings}

Web results:
{documents}
Summarize the external evidence with [citation:X] markers. Flag anything that conflicts with earlier findings.";

const CROSS_REFERENCE_TEMPLATE: &str = "Perform a cross-reference analysis of the sources gathered for: {query}

Findings so far:
{findings}

Sources:
{documents}
Analyze:
1. Common themes and patterns across sources
2. Contradictions or conflicting information
3. Information gaps or missing perspectives
4. Reliability of the different source types
5. Key insights that emerge from the combined sources";

const VERIFICATION_TEMPLATE: &str = "Verify the findings of this geospatial research against fresh evidence.

Query: {query}

Findings so far:
{findings}

Fresh evidence:
{documents}
For each major finding, state whether the evidence supports, weakens or does not address it, with [citation:X] markers. List remaining gaps.";

const REPORT_TEMPLATE: &str = "Write a geospatial research report for this query: {query}

Discovery findings:
{findings}

Sources consulted: {documents}

Structure the report as:
1. Executive Summary
2. Key Findings
3. Geospatial Analysis and Insights
4. Data Sources and Methodology
5. Limitations and Considerations
6. Recommendations for Further Research
7. Conclusion";

/// Note recorded on a step whose sources are disabled
pub const SKIPPED_NOTE: &str = "Skipped: sources for this step are disabled for the run";

/// The five-step research plan
pub fn canonical_plan(knowledge_base_terms: usize, web_terms: usize) -> Vec<StepDescriptor> {
    vec![
        StepDescriptor {
            name: "Query Analysis & Planning",
            retrieval: RetrievalPolicy::KnowledgeBase { terms: 0 },
            template: ANALYSIS_TEMPLATE,
            skippable: false,
            extracts_terms: true,
        },
        StepDescriptor {
            name: "Knowledge Base Deep Dive",
            retrieval: RetrievalPolicy::KnowledgeBase {
                terms: knowledge_base_terms,
            },
            template: KNOWLEDGE_BASE_TEMPLATE,
            skippable: true,
            extracts_terms: false,
        },
        StepDescriptor {
            name: "Web Intelligence Gathering",
            retrieval: RetrievalPolicy::Web { terms: web_terms },
            template: WEB_TEMPLATE,
            skippable: true,
            extracts_terms: false,
        },
        StepDescriptor {
            name: "Cross-Reference Analysis",
            retrieval: RetrievalPolicy::None,
            template: CROSS_REFERENCE_TEMPLATE,
            skippable: false,
            extracts_terms: false,
        },
        StepDescriptor {
            name: "Verification & Gap Review",
            retrieval: RetrievalPolicy::Combined,
            template: VERIFICATION_TEMPLATE,
            skippable: false,
            extracts_terms: false,
        },
    ]
}

/// Final report prompt
pub fn report_prompt(query: &str, findings: &str, source_count: usize) -> String {
    fill(REPORT_TEMPLATE, query, findings, &source_count.to_string())
}

fn fill(template: &str, query: &str, findings: &str, documents: &str) -> String {
    let findings = if findings.trim().is_empty() {
        "(none yet)"
    } else {
        findings
    };
    let documents = if documents.trim().is_empty() {
        "(no documents)\n"
    } else {
        documents
    };
    template
        .replace("{findings}", findings)
        .replace("{documents}", documents)
        .replace("{query}", query)
}

/// Split a synthesis into its body and the terms of a trailing `SEARCH TERMS:` line
pub fn split_search_terms(text: &str, max_terms: usize) -> (String, Vec<String>) {
    const MARKER: &str = "search terms:";

    let mut found = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().to_lowercase().starts_with(MARKER) {
            found = Some((offset, line));
        }
        offset += line.len();
    }
    let Some((line_start, line)) = found else {
        return (text.trim().to_string(), Vec::new());
    };
    let raw = line.trim().get(MARKER.len()..).unwrap_or_default();

    let mut terms: Vec<String> = Vec::new();
    for term in raw.split([',', ';']) {
        let term = term
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '-' || c == '.')
            .trim();
        if !term.is_empty() && !terms.iter().any(|t| t.eq_ignore_ascii_case(term)) {
            terms.push(term.to_string());
        }
    }
    terms.truncate(max_terms);

    let mut body = text[..line_start].to_string();
    body.push_str(&text[line_start + line.len()..]);
    (body.trim().to_string(), terms)
}
