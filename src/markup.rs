//! Editing of generated pages on scraper's html5ever tree.
//!
//! A page is parsed the way a browser would parse it, edited by node id and
//! serialized back out, so malformed markup from the model gets the same
//! recovery a browser applies.

use ego_tree::{NodeId, NodeMut, NodeRef};
use html5ever::{Attribute, LocalName, Namespace, QualName};
use scraper::node::Element;
use scraper::{Html, Node, Selector};

pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(source: &str) -> Self {
        Document {
            html: Html::parse_document(source),
        }
    }

    /// Elements matching `selector`, in document order.
    pub fn select(&self, selector: &Selector) -> Vec<NodeId> {
        self.html.select(selector).map(|el| el.id()).collect()
    }

    fn element(&self, id: NodeId) -> Option<&Element> {
        self.html.tree.get(id).and_then(|node| node.value().as_element())
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(Element::name)
    }

    /// Decoded value of attribute `name`.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?.attr(name)
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let Some(mut node) = self.html.tree.get_mut(id) else {
            return;
        };
        let Node::Element(element) = node.value() else {
            return;
        };

        let mut attrs: Vec<Attribute> = element
            .attrs
            .iter()
            .filter(|(qual, _)| !(qual.prefix.is_none() && &*qual.local == name))
            .map(|(qual, value)| Attribute {
                name: qual.clone(),
                value: value.clone(),
            })
            .collect();
        attrs.push(Attribute {
            name: QualName::new(None, Namespace::from(""), LocalName::from(name)),
            value: value.into(),
        });

        // Rebuilt rather than patched so the element's class and id caches
        // match the new attributes.
        let qual = element.name.clone();
        *element = Element::new(qual, attrs);
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        let existing = self.attr(id, "class").unwrap_or_default().trim().to_string();
        if existing.split_whitespace().any(|c| c == class) {
            return;
        }
        let joined = if existing.is_empty() {
            class.to_string()
        } else {
            format!("{} {}", existing, class)
        };
        self.set_attr(id, "class", &joined);
    }

    /// Appends `head_assets` to `<head>` and `body_assets` to `<body>`. The
    /// parser creates both elements when the source lacks them.
    pub fn append_assets(&mut self, head_assets: &str, body_assets: &str) {
        let root = self.html.root_element().id();
        let head = self.first("head").unwrap_or(root);
        let body = self.first("body").unwrap_or(root);
        self.append_markup(head, head_assets);
        self.append_markup(body, body_assets);
    }

    fn first(&self, tag: &str) -> Option<NodeId> {
        let selector = Selector::parse(tag).ok()?;
        self.html.select(&selector).next().map(|el| el.id())
    }

    fn append_markup(&mut self, parent: NodeId, markup: &str) {
        let fragment = Html::parse_fragment(markup);
        let source = fragment.root_element();
        if let Some(mut target) = self.html.tree.get_mut(parent) {
            graft(&mut target, *source);
        }
    }

    /// The serialized document, always starting with a doctype.
    pub fn to_html(&self) -> String {
        let html = self.html.html();
        let has_doctype = self.html.tree.root().children().any(|node| node.value().is_doctype());
        if has_doctype {
            html
        } else {
            format!("<!DOCTYPE html>\n{}", html)
        }
    }
}

fn graft(target: &mut NodeMut<'_, Node>, source: NodeRef<'_, Node>) {
    for child in source.children() {
        let mut copy = target.append(child.value().clone());
        graft(&mut copy, child);
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imgs(document: &Document) -> Vec<NodeId> {
        document.select(&Selector::parse("img").unwrap())
    }

    #[test]
    fn test_attributes_are_decoded() {
        let document = Document::parse(r#"<IMG Alt="Caf&eacute; &amp; terrace"src=x.jpg title="&#233;t&#xE9;" hidden>"#);
        let img = imgs(&document)[0];
        assert_eq!(document.name(img), Some("img"));
        assert_eq!(document.attr(img, "alt"), Some("Café & terrace"));
        assert_eq!(document.attr(img, "src"), Some("x.jpg"));
        assert_eq!(document.attr(img, "title"), Some("été"));
        assert_eq!(document.attr(img, "hidden"), Some(""));
        assert_eq!(document.attr(img, "width"), None);
    }

    #[test]
    fn test_scripts_and_comments_hold_no_elements() {
        let document = Document::parse(
            r#"<div><!-- <img alt="old"> --><script>let s = "<img alt='js'>";</script><img alt="real"></div>"#,
        );
        let found = imgs(&document);
        assert_eq!(found.len(), 1);
        assert_eq!(document.attr(found[0], "alt"), Some("real"));
    }

    #[test]
    fn test_set_attr_and_class() {
        let mut document = Document::parse(r#"<body><img alt="a" class="rounded"></body>"#);
        let img = imgs(&document)[0];
        document.set_attr(img, "src", "https://x/a.jpg?w=1&h=2");
        document.add_class(img, "responsive-img");
        document.add_class(img, "responsive-img");

        assert_eq!(document.attr(img, "src"), Some("https://x/a.jpg?w=1&h=2"));
        assert_eq!(document.attr(img, "class"), Some("rounded responsive-img"));
        assert_eq!(document.attr(img, "alt"), Some("a"));

        let html = document.to_html();
        assert!(html.contains(r#"src="https://x/a.jpg?w=1&amp;h=2""#));

        let reparsed = Document::parse(&html);
        let img = imgs(&reparsed)[0];
        assert_eq!(reparsed.attr(img, "class"), Some("rounded responsive-img"));
    }

    #[test]
    fn test_assets_in_full_document() {
        let mut document = Document::parse("<html><head><title>T</title></head><body><p>x</p></body></html>");
        document.append_assets("<link>", "<script></script>");
        assert_eq!(
            document.to_html(),
            "<!DOCTYPE html>\n<html><head><title>T</title><link></head><body><p>x</p><script></script></body></html>"
        );
    }

    #[test]
    fn test_assets_create_head_and_body() {
        let mut document = Document::parse("<html><p>x</p></html>");
        document.append_assets("<link>", "<script></script>");
        assert_eq!(
            document.to_html(),
            "<!DOCTYPE html>\n<html><head><link></head><body><p>x</p><script></script></body></html>"
        );
    }

    #[test]
    fn test_existing_doctype_is_kept_once() {
        let mut document = Document::parse("<!DOCTYPE html><html><body><header>h</header></body></html>");
        document.append_assets("<link>", "");
        let html = document.to_html();
        assert!(html.starts_with("<!DOCTYPE html><html><head><link></head><body><header>"));
        assert_eq!(html.matches("<!DOCTYPE").count(), 1);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<b>"Tom" & 'Jerry'</b>"#), "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;");
    }
}
