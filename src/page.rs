use scraper::{Html, Selector};

#[derive(Debug, Clone, PartialEq)]
pub struct PageLink {
    pub text: String,
    pub href: String,
}

fn normalize_text(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title_sel = Selector::parse("title").unwrap();
    document
        .select(&title_sel)
        .next()
        .map(|el| normalize_text(el.text().collect()))
        .filter(|s| !s.is_empty())
}

/// Links a visitor could follow, in document order, one per href.
pub fn page_links(html: &str) -> Vec<PageLink> {
    let document = Html::parse_document(html);
    let link_sel = Selector::parse("a[href]").unwrap();

    let mut links: Vec<PageLink> = Vec::new();
    for el in document.select(&link_sel) {
        let href = el.value().attr("href").unwrap_or("").trim().to_string();
        if href.is_empty() || href == "#" || href.to_lowercase().starts_with("javascript:") {
            continue;
        }
        if links.iter().any(|l| l.href == href) {
            continue;
        }

        let text = normalize_text(el.text().collect());
        let text = if text.is_empty() { href.clone() } else { text };
        links.push(PageLink { text, href });
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><head><title>
        Coffee   Roasting
    </title></head><body>
        <nav>
            <a href="#origins">Origins</a>
            <a href="/brewing/">Brewing   guides</a>
            <a href="#">Top</a>
            <a href="javascript:void(0)">Menu</a>
            <a href="https://www.coffee.org"><img alt="logo"></a>
            <a href="/brewing/">Brewing again</a>
        </nav>
    </body></html>"##;

    #[test]
    fn test_page_title() {
        assert_eq!(page_title(PAGE).as_deref(), Some("Coffee Roasting"));
        assert_eq!(page_title("<p>no title</p>"), None);
    }

    #[test]
    fn test_page_links() {
        let links = page_links(PAGE);
        assert_eq!(
            links,
            vec![
                PageLink {
                    text: "Origins".to_string(),
                    href: "#origins".to_string()
                },
                PageLink {
                    text: "Brewing guides".to_string(),
                    href: "/brewing/".to_string()
                },
                PageLink {
                    text: "https://www.coffee.org".to_string(),
                    href: "https://www.coffee.org".to_string()
                },
            ]
        );
    }
}
