use once_cell::sync::Lazy;
use regex::Regex;

static FENCED_HTML_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```html\s*([\s\S]*?)\s*```").unwrap());

static HTML_SPAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<html[\s\S]*?</html>").unwrap());

/// Pulls the HTML document out of free-form model output.
///
/// Tries a fenced ```` ```html ```` block first, then the first
/// `<html>...</html>` span, and otherwise hands the text back untouched.
pub fn extract_html(text: &str) -> String {
    if let Some(block) = FENCED_HTML_RE.captures(text).and_then(|c| c.get(1)) {
        return block.as_str().to_string();
    }

    if let Some(span) = HTML_SPAN_RE.find(text) {
        return span.as_str().to_string();
    }

    tracing::debug!("no HTML markers in model output, using it verbatim");
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let text = "Here is your site:\n```html\n<!DOCTYPE html>\n<html><body>Hi</body></html>\n```\nEnjoy!";
        assert_eq!(extract_html(text), "<!DOCTYPE html>\n<html><body>Hi</body></html>");
    }

    #[test]
    fn test_fence_is_case_insensitive() {
        let text = "```HTML\n<div>shout</div>\n```";
        assert_eq!(extract_html(text), "<div>shout</div>");
    }

    #[test]
    fn test_fence_wins_over_html_span() {
        let text = "<html><p>draft</p></html>\n```html\n<html><p>final</p></html>\n```";
        assert_eq!(extract_html(text), "<html><p>final</p></html>");
    }

    #[test]
    fn test_html_span() {
        let text = "Sure! <HTML lang=\"en\"><body>ok</body></HTML> Let me know if you need changes.";
        assert_eq!(extract_html(text), "<HTML lang=\"en\"><body>ok</body></HTML>");
    }

    #[test]
    fn test_html_span_is_shortest() {
        let text = "<html>one</html> and <html>two</html>";
        assert_eq!(extract_html(text), "<html>one</html>");
    }

    #[test]
    fn test_fallback_returns_input() {
        let text = "I could not build that page.";
        assert_eq!(extract_html(text), text);
        assert_eq!(extract_html(""), "");
    }
}
