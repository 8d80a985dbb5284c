//! Code extraction from model responses.
//!
//! Models wrap code in markdown fences, prepend prose, or hand back a bare
//! script. Extraction normalizes all of that into executable source, and
//! returns nothing at all when the response is explanation with no code.

use regex::Regex;

/// Phrases that mark the text as commentary rather than a program when no
/// fence or code shape is found.
const EXPLANATORY_MARKERS: &[&str] = &[
    "here is",
    "below is",
    "this code",
    "this script",
    "usage notes",
    "explanation:",
];

/// Pull executable source out of a raw model response.
///
/// Preference order: the first fenced block that looks like code, then the
/// whole response if it reads as bare code. Returns `None` when the
/// response is prose so the caller can count the attempt as failed and
/// regenerate.
pub fn extract_code(response: &str) -> Option<String> {
    let response = response.trim();
    if response.is_empty() {
        return None;
    }

    if let Some(block) = first_fenced_block(response) {
        if looks_like_code(&block) {
            return Some(block);
        }
    }

    if looks_like_code(response) {
        return Some(response.to_string());
    }

    None
}

/// The first ```-fenced block, tolerating an optional language tag.
fn first_fenced_block(response: &str) -> Option<String> {
    // Fence regex is infallible on a literal pattern, but stay on the
    // error path anyway.
    let re = Regex::new(r"(?s)```(?:python|py|sh|bash)?\s*\n(.*?)\n\s*```").ok()?;
    re.captures(response)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|block| !block.is_empty())
}

/// Heuristic shape check: code has import/def/assignment lines, prose has
/// explanatory lead-ins and sentences.
fn looks_like_code(text: &str) -> bool {
    if text.len() < 20 {
        return false;
    }

    let lowered = text.to_lowercase();
    let first_line = lowered.lines().next().unwrap_or("");
    if EXPLANATORY_MARKERS.iter().any(|m| first_line.contains(m)) {
        return false;
    }

    const INDICATORS: &[&str] = &[
        "import ", "from ", "def ", "class ", "print(", "return ", "if ", "for ", "try:",
        "#!/",
    ];
    let head: Vec<&str> = text.lines().take(10).map(str::trim).collect();
    head.iter()
        .any(|line| INDICATORS.iter().any(|ind| line.starts_with(ind)))
}
