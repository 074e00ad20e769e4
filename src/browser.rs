use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::generate::{EditRequest, GeneratedPage, GenerationEvent, GenerationRequest, RequestId, Stage};
use crate::page::{page_links, page_title, PageLink};

pub const ADDRESS_SUFFIX: &str = ".gen";

/// Topic typed into the address bar, with an optional `.gen` suffix.
pub fn parse_address(input: &str) -> Option<String> {
    let input = input.trim();
    let topic = match input.len().checked_sub(ADDRESS_SUFFIX.len()) {
        Some(cut) if input.is_char_boundary(cut) && input[cut..].eq_ignore_ascii_case(ADDRESS_SUFFIX) => &input[..cut],
        _ => input,
    };
    let topic = topic.trim();
    (!topic.is_empty()).then(|| topic.to_string())
}

pub fn address_for(topic: &str) -> String {
    format!("{}{}", topic, ADDRESS_SUFFIX)
}

/// File-name stem for a saved page.
pub fn page_slug(topic: &str) -> String {
    let mut slug = String::new();
    for c in topic.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "page".to_string()
    } else {
        slug.to_string()
    }
}

/// Writes `html` to `<dir>/<slug>.html`, replacing any earlier save.
pub async fn save_page(dir: &Path, topic: &str, html: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{}.html", page_slug(topic)));
    tokio::fs::write(&path, html)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabKey(usize);

#[derive(Debug, Clone)]
pub enum TabState {
    Loading { stage: Stage, pull: Option<(String, f32)> },
    Ready(GeneratedPage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Assistant => "AI Assistant",
        }
    }
}

/// One line of a tab's edit conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Tab {
    pub key: TabKey,
    /// The request whose result this tab is waiting for or showing.
    pub request: RequestId,
    pub title: String,
    pub topic: String,
    pub site: String,
    pub state: TabState,
    pub links: Vec<PageLink>,
    pub chat: Vec<ChatTurn>,
    /// Set while `request` is an edit whose outcome belongs in `chat`.
    editing: bool,
}

impl Tab {
    pub fn address(&self) -> String {
        address_for(&self.topic)
    }

    pub fn page(&self) -> Option<&GeneratedPage> {
        match &self.state {
            TabState::Ready(page) => Some(page),
            TabState::Loading { .. } => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, TabState::Loading { .. })
    }
}

/// Open tabs plus the per-site designs reused by subpages.
#[derive(Debug, Default)]
pub struct Session {
    tabs: Vec<Tab>,
    active: Option<TabKey>,
    next_key: usize,
    designs: HashMap<String, String>,
}

impl Session {
    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn tab(&self, key: TabKey) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.key == key)
    }

    fn tab_mut(&mut self, key: TabKey) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.key == key)
    }

    /// `None` is the home tab.
    pub fn active(&self) -> Option<TabKey> {
        self.active
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.active.and_then(|key| self.tab(key))
    }

    pub fn select(&mut self, key: Option<TabKey>) {
        self.active = key.filter(|k| self.tab(*k).is_some());
    }

    pub fn design_for(&self, site: &str) -> Option<&str> {
        self.designs.get(site).map(String::as_str)
    }

    pub fn loading_count(&self) -> usize {
        self.tabs.iter().filter(|t| t.is_loading()).count()
    }

    /// Opens and activates a loading tab for `request`.
    pub fn open(&mut self, request: &GenerationRequest) -> TabKey {
        let key = TabKey(self.next_key);
        self.next_key += 1;
        self.tabs.push(Tab {
            key,
            request: request.id,
            title: request.topic.clone(),
            topic: request.topic.clone(),
            site: request.site.clone(),
            state: TabState::Loading {
                stage: Stage::Pending,
                pull: None,
            },
            links: Vec::new(),
            chat: Vec::new(),
            editing: false,
        });
        self.active = Some(key);
        key
    }

    /// Points an existing tab at a new request. A result for the request it
    /// was waiting on before is dropped when it arrives.
    pub fn restart(&mut self, key: TabKey, request: RequestId) -> bool {
        match self.tab_mut(key) {
            Some(tab) => {
                tab.request = request;
                tab.editing = false;
                tab.state = TabState::Loading {
                    stage: Stage::Pending,
                    pull: None,
                };
                true
            }
            None => false,
        }
    }

    pub fn close(&mut self, key: TabKey) {
        let Some(index) = self.tabs.iter().position(|t| t.key == key) else {
            return;
        };
        self.tabs.remove(index);

        if self.active == Some(key) {
            self.active = self
                .tabs
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|i| self.tabs.get(i)))
                .map(|t| t.key);
        }
    }

    pub fn apply_event(&mut self, event: &GenerationEvent) {
        let id = match event {
            GenerationEvent::Stage { id, .. } | GenerationEvent::Pulling { id, .. } => *id,
        };
        let Some(tab) = self.tabs.iter_mut().find(|t| t.request == id) else {
            return;
        };
        let TabState::Loading { stage, pull } = &mut tab.state else {
            return;
        };

        match event {
            GenerationEvent::Stage { stage: next, .. } => *stage = *next,
            GenerationEvent::Pulling { model, fraction, .. } => *pull = Some((model.clone(), *fraction)),
        }
    }

    /// Hands a finished page to the tab waiting for it. Returns the tab, or
    /// `None` when that tab was closed or has moved on to another request.
    pub fn deliver(&mut self, page: GeneratedPage) -> Option<TabKey> {
        let Some(tab) = self.tabs.iter_mut().find(|t| t.request == page.id) else {
            tracing::debug!(id = %page.id, topic = %page.topic, "dropping result with no waiting tab");
            return None;
        };

        if page.is_error() {
            tab.title = tab.topic.clone();
            tab.links.clear();
        } else {
            refresh(tab, &page.html, &mut self.designs);
        }

        if std::mem::take(&mut tab.editing) {
            let text = match &page.error {
                Some(error) => format!("Error: {}", error),
                None => "Updated the page.".to_string(),
            };
            tab.chat.push(ChatTurn {
                speaker: Speaker::Assistant,
                text,
            });
        }

        tab.state = TabState::Ready(page);
        Some(tab.key)
    }

    /// Sends the tab to `request` and records the instruction in its chat.
    pub fn begin_edit(&mut self, key: TabKey, request: &EditRequest) -> bool {
        if !self.restart(key, request.id) {
            return false;
        }
        let Some(tab) = self.tab_mut(key) else {
            return false;
        };
        tab.editing = true;
        tab.chat.push(ChatTurn {
            speaker: Speaker::User,
            text: request.instruction.clone(),
        });
        true
    }

    /// Replaces a shown page's markup with hand-edited source. Returns false
    /// when the tab is gone or still loading.
    pub fn apply_source(&mut self, key: TabKey, html: &str) -> bool {
        let Some(tab) = self.tabs.iter_mut().find(|t| t.key == key) else {
            return false;
        };
        let TabState::Ready(page) = &mut tab.state else {
            return false;
        };
        page.html = html.to_string();
        page.error = None;
        refresh(tab, html, &mut self.designs);
        true
    }

    /// A fresh generation of the tab's topic, keeping its site's design.
    pub fn reroll_request(&self, key: TabKey, model: &str) -> Option<GenerationRequest> {
        let tab = self.tab(key)?;
        let mut request = GenerationRequest::new(&tab.topic, model);
        request.site = tab.site.clone();
        if !request.is_front_page() {
            request.base_design = self.design_for(&tab.site).map(str::to_string);
        }
        Some(request)
    }

    pub fn link_request(&self, key: TabKey, href: &str, model: &str) -> Option<GenerationRequest> {
        let tab = self.tab(key)?;
        Some(GenerationRequest::for_link(&tab.site, href, self.design_for(&tab.site), model))
    }

    pub fn edit_request(&self, key: TabKey, model: &str, instruction: &str) -> Option<EditRequest> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return None;
        }
        let tab = self.tab(key)?;
        let page = tab.page()?;
        Some(EditRequest::new(&tab.topic, model, &page.html, instruction))
    }
}

/// Title and links from a good page. A front page also becomes its site's design.
fn refresh(tab: &mut Tab, html: &str, designs: &mut HashMap<String, String>) {
    tab.title = page_title(html).unwrap_or_else(|| tab.topic.clone());
    tab.links = page_links(html);
    if tab.topic == tab.site {
        designs.insert(tab.site.clone(), html.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: RequestId, topic: &str, html: &str) -> GeneratedPage {
        GeneratedPage {
            id,
            topic: topic.to_string(),
            html: html.to_string(),
            images: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("  Coffee roasting.gen ").as_deref(), Some("Coffee roasting"));
        assert_eq!(parse_address("Tide pools").as_deref(), Some("Tide pools"));
        assert_eq!(parse_address("Bees.GEN").as_deref(), Some("Bees"));
        assert_eq!(parse_address(".gen"), None);
        assert_eq!(parse_address("   "), None);
        assert_eq!(parse_address("café").as_deref(), Some("café"));
    }

    #[test]
    fn test_page_slug() {
        assert_eq!(page_slug("Coffee - brewing guides"), "coffee-brewing-guides");
        assert_eq!(page_slug("https://tea.example"), "https-tea-example");
        assert_eq!(page_slug("!!!"), "page");
    }

    #[tokio::test]
    async fn test_save_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let pages = dir.path().join("pages");

        let path = save_page(&pages, "Bees", "<h1>one</h1>").await.unwrap();
        save_page(&pages, "Bees", "<h1>two</h1>").await.unwrap();

        assert_eq!(path, pages.join("bees.html"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<h1>two</h1>");
    }

    #[test]
    fn test_duplicate_titles_route_by_id() {
        let mut session = Session::default();
        let first = GenerationRequest::new("Bees", "m");
        let second = GenerationRequest::new("Bees", "m");
        let first_tab = session.open(&first);
        let second_tab = session.open(&second);

        let key = session.deliver(page(second.id, "Bees", "<title>Second hive</title>"));

        assert_eq!(key, Some(second_tab));
        assert_eq!(session.tab(second_tab).unwrap().title, "Second hive");
        assert!(session.tab(first_tab).unwrap().is_loading());
    }

    #[test]
    fn test_result_for_closed_tab_is_dropped() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Bees", "m");
        let key = session.open(&request);
        session.close(key);

        assert_eq!(session.deliver(page(request.id, "Bees", "<p>late</p>")), None);
        assert!(session.tabs().is_empty());
        assert_eq!(session.active(), None);
    }

    #[test]
    fn test_superseded_result_is_dropped() {
        let mut session = Session::default();
        let original = GenerationRequest::new("Bees", "m");
        let key = session.open(&original);
        let reroll = session.reroll_request(key, "m").unwrap();
        session.restart(key, reroll.id);

        assert_eq!(session.deliver(page(original.id, "Bees", "<p>old</p>")), None);
        assert!(session.tab(key).unwrap().is_loading());
        assert_eq!(session.deliver(page(reroll.id, "Bees", "<p>new</p>")), Some(key));
    }

    #[test]
    fn test_front_page_design_is_cached() {
        let mut session = Session::default();
        let front = GenerationRequest::new("Coffee", "m");
        let key = session.open(&front);
        let html = r#"<html><head><title>Coffee</title></head><body><a href="/brewing/">Brewing</a></body></html>"#;
        session.deliver(page(front.id, "Coffee", html));

        assert_eq!(session.design_for("Coffee"), Some(html));
        assert_eq!(session.tab(key).unwrap().links.len(), 1);

        let sub = session.link_request(key, "/brewing/", "m").unwrap();
        assert_eq!(sub.topic, "Coffee - brewing");
        assert_eq!(sub.base_design.as_deref(), Some(html));

        let sub_key = session.open(&sub);
        session.deliver(page(sub.id, &sub.topic, "<html><title>Brewing</title></html>"));
        assert_eq!(session.design_for("Coffee"), Some(html));

        let again = session.reroll_request(sub_key, "m").unwrap();
        assert_eq!(again.site, "Coffee");
        assert_eq!(again.base_design.as_deref(), Some(html));
    }

    #[test]
    fn test_error_page_is_not_cached() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Coffee", "m");
        let key = session.open(&request);
        let mut failed = page(request.id, "Coffee", "<title>Error</title>");
        failed.error = Some("boom".to_string());
        session.deliver(failed);

        assert_eq!(session.design_for("Coffee"), None);
        assert_eq!(session.tab(key).unwrap().title, "Coffee");
    }

    #[test]
    fn test_events_update_loading_tab() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Bees", "m");
        let key = session.open(&request);

        session.apply_event(&GenerationEvent::Stage {
            id: request.id,
            stage: Stage::ModelCalled,
        });
        session.apply_event(&GenerationEvent::Pulling {
            id: request.id,
            model: "m".to_string(),
            fraction: 0.25,
        });

        match &session.tab(key).unwrap().state {
            TabState::Loading { stage, pull } => {
                assert_eq!(*stage, Stage::ModelCalled);
                assert_eq!(pull.clone(), Some(("m".to_string(), 0.25)));
            }
            TabState::Ready(_) => panic!("tab should still be loading"),
        }
    }

    #[test]
    fn test_edit_request_needs_a_page() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Bees", "m");
        let key = session.open(&request);
        assert!(session.edit_request(key, "m", "make it blue").is_none());

        session.deliver(page(request.id, "Bees", "<h1>Bees</h1>"));
        assert!(session.edit_request(key, "m", "   ").is_none());
        let edit = session.edit_request(key, "m", "make it blue").unwrap();
        assert_eq!(edit.current_html, "<h1>Bees</h1>");
        assert_eq!(edit.instruction, "make it blue");
    }

    #[test]
    fn test_edit_outcomes_are_kept_in_chat() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Bees", "m");
        let key = session.open(&request);
        session.deliver(page(request.id, "Bees", "<h1>Bees</h1>"));
        assert!(session.tab(key).unwrap().chat.is_empty());

        let edit = session.edit_request(key, "m", "make it blue").unwrap();
        assert!(session.begin_edit(key, &edit));
        assert!(session.tab(key).unwrap().is_loading());
        session.deliver(page(edit.id, "Bees", "<h1 style=\"color:blue\">Bees</h1>"));

        let edit = session.edit_request(key, "m", "add a footer").unwrap();
        session.begin_edit(key, &edit);
        let mut failed = page(edit.id, "Bees", "<p>error</p>");
        failed.error = Some("model unreachable".to_string());
        session.deliver(failed);

        let chat: Vec<_> = session
            .tab(key)
            .unwrap()
            .chat
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker.label(), turn.text))
            .collect();
        assert_eq!(
            chat,
            vec![
                "You: make it blue",
                "AI Assistant: Updated the page.",
                "You: add a footer",
                "AI Assistant: Error: model unreachable",
            ]
        );
    }

    #[test]
    fn test_reroll_after_edit_adds_no_reply() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Bees", "m");
        let key = session.open(&request);
        session.deliver(page(request.id, "Bees", "<h1>Bees</h1>"));

        let edit = session.edit_request(key, "m", "make it blue").unwrap();
        session.begin_edit(key, &edit);
        let reroll = session.reroll_request(key, "m").unwrap();
        session.restart(key, reroll.id);
        session.deliver(page(reroll.id, "Bees", "<h1>Bees again</h1>"));

        let chat = &session.tab(key).unwrap().chat;
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].speaker, Speaker::User);
    }

    #[test]
    fn test_apply_source_refreshes_tab() {
        let mut session = Session::default();
        let request = GenerationRequest::new("Coffee", "m");
        let key = session.open(&request);
        assert!(!session.apply_source(key, "<p>too early</p>"));

        session.deliver(page(request.id, "Coffee", "<html><title>Coffee</title></html>"));
        let edited = r#"<html><head><title>Coffee beans</title></head><body><a href="/origins/">Origins</a></body></html>"#;
        assert!(session.apply_source(key, edited));

        let tab = session.tab(key).unwrap();
        assert_eq!(tab.title, "Coffee beans");
        assert_eq!(tab.links.len(), 1);
        assert_eq!(tab.links[0].href, "/origins/");
        assert_eq!(tab.page().unwrap().html, edited);
        assert_eq!(session.design_for("Coffee"), Some(edited));
    }

    #[test]
    fn test_close_moves_selection() {
        let mut session = Session::default();
        let a = session.open(&GenerationRequest::new("A", "m"));
        let b = session.open(&GenerationRequest::new("B", "m"));
        let c = session.open(&GenerationRequest::new("C", "m"));

        session.select(Some(b));
        session.close(b);
        assert_eq!(session.active(), Some(c));
        session.close(c);
        assert_eq!(session.active(), Some(a));
        session.close(a);
        assert_eq!(session.active(), None);
    }
}
