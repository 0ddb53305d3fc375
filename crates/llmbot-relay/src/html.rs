//! Rendering chatbot HTML output as markdown-flavoured plain text

use once_cell::sync::Lazy;
use regex::Regex;

static LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static BLOCK_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|div|h[1-6]|ul|ol|table|tr|blockquote)>").unwrap());
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<li[^>]*>").unwrap());
static LIST_ITEM_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</li>").unwrap());
static CODE_BLOCK_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<pre[^>]*>\s*<code[^>]*>").unwrap());
static CODE_BLOCK_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</code>\s*</pre>").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?code[^>]*>").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?(strong|b)>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Convert an HTML fragment to text, keeping lists, code and emphasis readable
///
/// Input without markup only gets its entities decoded and its replacement
/// characters dropped; some spaces emit those for split multi-byte sequences.
pub fn to_text(html: &str) -> String {
    let cleaned = html.replace('\u{FFFD}', "");
    if !cleaned.contains('<') {
        return decode_entities(&cleaned);
    }

    let text = CODE_BLOCK_START.replace_all(&cleaned, "\n```\n");
    let text = CODE_BLOCK_END.replace_all(&text, "\n```\n");
    let text = INLINE_CODE.replace_all(&text, "`");
    let text = BOLD.replace_all(&text, "**");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = LIST_ITEM.replace_all(&text, "- ");
    let text = LIST_ITEM_END.replace_all(&text, "\n");
    let text = BLOCK_END.replace_all(&text, "\n\n");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    BLANK_LINES.replace_all(&text, "\n\n").trim().to_string()
}

/// Named, decimal and hex entities; non-breaking spaces become plain ones
fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).replace('\u{A0}', " ")
}
