use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{GenError, Result};
use crate::extract::extract_html;
use crate::images::{ImageSearch, ResolvedImage};
use crate::markup::escape_html;
use crate::ollama::{Availability, ChatMessage, ModelBackend};
use crate::postprocess::PagePostProcessor;

const GENERATION_SYSTEM_PROMPT: &str = "You are an assistant that generates unique, creative, and high-quality HTML, CSS, and JavaScript content without any markdown or code blocks.";

const EDIT_SYSTEM_PROMPT: &str = "You are an assistant that helps edit HTML and JavaScript code.";

/// Identifies one in-flight request; results are routed by this, never by
/// tab title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub topic: String,
    /// Topic of the site this page belongs to; equals `topic` for a site's
    /// front page.
    pub site: String,
    pub model: String,
    pub base_design: Option<String>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, model: impl Into<String>) -> Self {
        let topic = topic.into();
        GenerationRequest {
            id: RequestId::next(),
            site: topic.clone(),
            topic,
            model: model.into(),
            base_design: None,
        }
    }

    #[cfg(test)]
    pub fn with_base_design(mut self, html: impl Into<String>) -> Self {
        self.base_design = Some(html.into());
        self
    }

    /// Request for the page behind a link on a generated page. External
    /// links start a new site; internal ones become a subpage that keeps
    /// the site's design.
    pub fn for_link(site: &str, href: &str, base_design: Option<&str>, model: &str) -> Self {
        let href = href.trim();
        if href.starts_with("http") || href.starts_with("www") {
            return GenerationRequest::new(href.trim_matches('/'), model);
        }

        let page = href.trim_matches(|c| c == '/' || c == '#');
        let mut request = GenerationRequest::new(format!("{} - {}", site, page), model);
        request.site = site.to_string();
        request.base_design = base_design.map(str::to_string);
        request
    }

    pub fn is_front_page(&self) -> bool {
        self.site == self.topic
    }
}

/// An assistant-chat instruction applied to an existing page.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub id: RequestId,
    pub topic: String,
    pub model: String,
    pub current_html: String,
    pub instruction: String,
}

impl EditRequest {
    pub fn new(topic: &str, model: &str, current_html: &str, instruction: &str) -> Self {
        EditRequest {
            id: RequestId::next(),
            topic: topic.to_string(),
            model: model.to_string(),
            current_html: current_html.to_string(),
            instruction: instruction.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    ModelCalled,
    ExtractDone,
    PostProcessDone,
    Delivered,
    ErrorDelivered,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Pending => "Waiting for the model...",
            Stage::ModelCalled => "Thinking about the topic...",
            Stage::ExtractDone => "Fetching relevant images...",
            Stage::PostProcessDone => "Almost there...",
            Stage::Delivered => "Done",
            Stage::ErrorDelivered => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Stage { id: RequestId, stage: Stage },
    Pulling { id: RequestId, model: String, fraction: f32 },
}

#[derive(Debug, Clone)]
pub struct GeneratedPage {
    pub id: RequestId,
    pub topic: String,
    pub html: String,
    pub images: Vec<ResolvedImage>,
    /// Set when `html` is a diagnostic page.
    pub error: Option<String>,
}

impl GeneratedPage {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub fn generation_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let topic = &request.topic;
    let mut prompt = format!(
        "Using HTML, CSS, and JavaScript, create a unique, modern, and professional website about {topic}.
Use modern web design practices and a framework such as Bootstrap or Materialize.
Be imaginative: add design elements, interactive features, animations and interesting layouts.
Make sure all code is valid and free of JavaScript errors.
Important: do not use placeholder text such as \"Lorem ipsum\". Write meaningful content about {topic}.
Add relevant images with <img> tags that have descriptive alt attributes, and use inline CSS 'background-image' styles with placeholder URLs like 'your_image_here.jpg'.
Do not include any real image URLs in the code.
Do not include any external links except CDN links to Bootstrap or other frameworks."
    );

    if let Some(base) = request.base_design.as_deref().filter(|b| !b.trim().is_empty()) {
        prompt.push_str("\n\nMaintain the same overall design and layout as the following HTML:\n\n");
        prompt.push_str(base);
    }

    vec![ChatMessage::system(GENERATION_SYSTEM_PROMPT), ChatMessage::user(prompt)]
}

pub fn edit_messages(request: &EditRequest) -> Vec<ChatMessage> {
    let prompt = format!(
        "You are a web assistant. Modify the following HTML/JavaScript based on the user's request.\n\n\
         Request: {}\n\n\
         Reply with the complete updated page.\n\n\
         Current page:\n\n{}",
        request.instruction, request.current_html
    );
    vec![ChatMessage::system(EDIT_SYSTEM_PROMPT), ChatMessage::user(prompt)]
}

pub fn error_page(message: &str) -> String {
    format!(
        "<html>\n    <head><title>Error</title></head>\n    <body><h1>Error generating content</h1><p>{}</p></body>\n</html>\n",
        escape_html(message)
    )
}

struct Events {
    id: RequestId,
    tx: Option<mpsc::UnboundedSender<GenerationEvent>>,
}

impl Events {
    fn send(&self, event: GenerationEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    fn stage(&self, stage: Stage) {
        self.send(GenerationEvent::Stage { id: self.id, stage });
    }

    fn pulling(&self, model: &str, fraction: f32) {
        self.send(GenerationEvent::Pulling {
            id: self.id,
            model: model.to_string(),
            fraction,
        });
    }
}

pub struct Generator<M, S> {
    model: Arc<M>,
    postprocessor: PagePostProcessor<S>,
}

impl<M: ModelBackend, S: ImageSearch> Generator<M, S> {
    pub fn new(model: Arc<M>, postprocessor: PagePostProcessor<S>) -> Self {
        Generator { model, postprocessor }
    }

    /// Builds the page for `request`. Failures come back as a diagnostic
    /// page, so the caller always has something to show.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        events: Option<mpsc::UnboundedSender<GenerationEvent>>,
    ) -> GeneratedPage {
        let messages = generation_messages(request);
        self.run(request.id, &request.topic, &request.model, &messages, events).await
    }

    pub async fn edit(
        &self,
        request: &EditRequest,
        events: Option<mpsc::UnboundedSender<GenerationEvent>>,
    ) -> GeneratedPage {
        let messages = edit_messages(request);
        self.run(request.id, &request.topic, &request.model, &messages, events).await
    }

    async fn run(
        &self,
        id: RequestId,
        topic: &str,
        model: &str,
        messages: &[ChatMessage],
        events: Option<mpsc::UnboundedSender<GenerationEvent>>,
    ) -> GeneratedPage {
        let events = Events { id, tx: events };
        events.stage(Stage::Pending);
        tracing::info!(%id, topic, model, "generating page");

        match self.call_model(model, messages, &events).await {
            Ok(text) => {
                let html = extract_html(&text);
                events.stage(Stage::ExtractDone);

                let processed = self.postprocessor.process(&html, topic).await;
                events.stage(Stage::PostProcessDone);

                tracing::info!(%id, topic, images = processed.images.len(), "page ready");
                events.stage(Stage::Delivered);
                GeneratedPage {
                    id,
                    topic: topic.to_string(),
                    html: processed.html,
                    images: processed.images,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(%id, topic, "generation failed: {}", e);
                events.stage(Stage::ErrorDelivered);
                let message = e.to_string();
                GeneratedPage {
                    id,
                    topic: topic.to_string(),
                    html: error_page(&message),
                    images: Vec::new(),
                    error: Some(message),
                }
            }
        }
    }

    /// Pre-flight, provision if needed, then chat. At most one pull and one
    /// retried chat call per request.
    async fn call_model(&self, model: &str, messages: &[ChatMessage], events: &Events) -> Result<String> {
        let mut provisioned = false;

        match self.model.availability(model).await {
            Ok(Availability::Ready) => {}
            Ok(Availability::NeedsProvisioning) => {
                self.provision(model, events).await?;
                provisioned = true;
            }
            Err(e) => tracing::warn!(model, "availability check failed, calling the model anyway: {}", e),
        }

        events.stage(Stage::ModelCalled);
        match self.model.chat(model, messages).await {
            Err(GenError::ModelMissing(_)) if !provisioned => {
                tracing::warn!(model, "model reported missing, pulling before one retry");
                self.provision(model, events).await?;
                self.model.chat(model, messages).await
            }
            result => result,
        }
    }

    async fn provision(&self, model: &str, events: &Events) -> Result<()> {
        tracing::info!(model, "pulling model");
        events.pulling(model, 0.0);
        let mut report = |fraction: f32| events.pulling(model, fraction);
        self.model.pull(model, &mut report).await
    }
}
