mod bookmarks;
mod browser;
mod config;
mod error;
mod extract;
mod generate;
mod images;
mod markup;
mod ollama;
mod page;
mod postprocess;
mod progress;

use futures_util::stream;
use iced::{
    alignment,
    event::{self, Event as IcedEvent},
    keyboard::{self, Key},
    time, clipboard,
    widget::{button, column, container, horizontal_space, pick_list, progress_bar, row, scrollable, text, text_editor, text_input, text_input::Id, Column},
    window, Color, Element, Font, Length, Subscription, Task, Theme,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use bookmarks::Bookmarks;
use browser::{parse_address, Session, Speaker, TabKey, TabState};
use generate::{GeneratedPage, GenerationEvent, GenerationRequest, Generator};
use images::{ImageResolver, WikimediaSearch};
use ollama::OllamaClient;
use postprocess::PagePostProcessor;
use progress::Kind;

type Browser = Generator<OllamaClient, WikimediaSearch>;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn main() -> iced::Result {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gen_browser=info")))
        .init();

    let config = config::Config::load();
    let window = window::Settings {
        size: iced::Size::new(config.window.width as f32, config.window.height as f32),
        min_size: Some(iced::Size::new(config.window.min_width as f32, config.window.min_height as f32)),
        position: window::Position::Centered,
        ..Default::default()
    };

    iced::application("Gen Browser", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window)
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    AddressChanged(String),
    Submit,
    ModelSelected(String),
    ModelsLoaded(Result<Vec<String>, String>),
    SelectTab(Option<TabKey>),
    CloseTab(TabKey),
    Generation(GenerationEvent),
    PageReady(GeneratedPage),
    Reroll,
    FollowLink(String),
    ChatChanged(String),
    ChatSubmit,
    CopyHtml,
    SavePage,
    PageSaved(Result<PathBuf, String>),
    AddBookmark,
    OpenBookmark(String),
    DeleteBookmark(String),
    ToggleBookmarks,
    ToggleSource,
    SourceEdited(text_editor::Action),
    ApplySource,
    RevertSource,
    ToggleTheme,
    ClearLog,
    Escape,
    Tick,
}

struct App {
    generator: Arc<Browser>,
    session: Session,
    bookmarks: Bookmarks,
    pages_dir: PathBuf,
    address: String,
    models: Vec<String>,
    model: String,
    chat_input: String,
    show_bookmarks: bool,
    show_source: bool,
    source: text_editor::Content,
    dark_mode: bool,
    loading_frame: usize,
    address_id: Id,
}

fn build_generator(config: &config::Config, ollama: Arc<OllamaClient>) -> Browser {
    let images = &config.images;
    let search = WikimediaSearch::new(
        images.api_url.clone(),
        &images.user_agent,
        Duration::from_secs(images.timeout_secs),
    );
    let postprocessor = PagePostProcessor::new(ImageResolver::new(search, images.candidate_limit), images.max_attempts)
        .with_limits(
            images.concurrency,
            Duration::from_secs(images.timeout_secs),
            Duration::from_secs(images.page_timeout_secs),
        );
    Generator::new(ollama, postprocessor)
}

/// Relays generation events from `rx` into the update loop until the
/// sender is dropped.
fn follow_events(rx: mpsc::UnboundedReceiver<GenerationEvent>) -> Task<Message> {
    let events = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) });
    Task::run(events, Message::Generation)
}

impl App {
    fn new(config: config::Config) -> (Self, Task<Message>) {
        let ollama = Arc::new(OllamaClient::with_config(
            config.ollama.host.clone(),
            config.ollama.request_timeout(),
        ));
        let generator = Arc::new(build_generator(&config, ollama.clone()));

        let mut models = config.ollama.models.clone();
        if !models.contains(&config.ollama.model) {
            models.insert(0, config.ollama.model.clone());
        }

        let bookmarks = Bookmarks::load(config::Config::bookmarks_path());
        progress::log(format!("Using {} at {}", config.ollama.model, ollama.base_url()));
        progress::log(format!("{} bookmarks loaded", bookmarks.len()));

        let address_id = Id::unique();
        let app = App {
            generator,
            session: Session::default(),
            bookmarks,
            pages_dir: config::Config::pages_dir(),
            address: String::new(),
            models,
            model: config.ollama.model.clone(),
            chat_input: String::new(),
            show_bookmarks: false,
            show_source: false,
            source: text_editor::Content::new(),
            dark_mode: config.window.dark_mode,
            loading_frame: 0,
            address_id: address_id.clone(),
        };

        let focus_task = text_input::focus(address_id);
        let models_task = Task::perform(
            async move { ollama.installed_models().await.map_err(|e| e.to_string()) },
            Message::ModelsLoaded,
        );

        (app, Task::batch([focus_task, models_task]))
    }

    fn generate(&mut self, request: GenerationRequest) -> Task<Message> {
        let key = self.session.open(&request);
        self.show_bookmarks = false;
        self.address = browser::address_for(&request.topic);
        self.run_generation(key, request)
    }

    fn run_generation(&mut self, key: TabKey, request: GenerationRequest) -> Task<Message> {
        self.session.restart(key, request.id);
        progress::log_with(Kind::Request, format!("Generating \"{}\" with {}", request.topic, request.model));

        let (tx, rx) = mpsc::unbounded_channel();
        let generator = self.generator.clone();
        let page = Task::perform(
            async move { generator.generate(&request, Some(tx)).await },
            Message::PageReady,
        );
        Task::batch([follow_events(rx), page])
    }

    /// Fills the source editor from the active tab's page.
    fn load_source(&mut self) {
        let html = self
            .session
            .active_tab()
            .and_then(|t| t.page())
            .map(|page| page.html.as_str())
            .unwrap_or_default();
        self.source = text_editor::Content::with_text(html);
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::AddressChanged(value) => {
                self.address = value;
                Task::none()
            }
            Message::Submit => match parse_address(&self.address) {
                Some(topic) => self.generate(GenerationRequest::new(topic, self.model.clone())),
                None => Task::none(),
            },
            Message::ModelSelected(model) => {
                progress::log(format!("Model set to {}", model));
                self.model = model;
                Task::none()
            }
            Message::ModelsLoaded(Ok(installed)) => {
                for name in installed {
                    if !self.models.contains(&name) {
                        self.models.push(name);
                    }
                }
                Task::none()
            }
            Message::ModelsLoaded(Err(e)) => {
                tracing::warn!("could not list installed models: {}", e);
                progress::log_with(Kind::Error, format!("Ollama unreachable: {}", e));
                Task::none()
            }
            Message::SelectTab(key) => {
                self.session.select(key);
                self.address = self.session.active_tab().map(|t| t.address()).unwrap_or_default();
                self.show_bookmarks = false;
                self.load_source();
                Task::none()
            }
            Message::CloseTab(key) => {
                self.session.close(key);
                self.address = self.session.active_tab().map(|t| t.address()).unwrap_or_default();
                self.load_source();
                Task::none()
            }
            Message::Generation(event) => {
                if let GenerationEvent::Pulling { model, fraction, .. } = &event {
                    if *fraction == 0.0 {
                        progress::log_with(Kind::Pull, format!("Pulling {}...", model));
                    } else if *fraction >= 1.0 {
                        progress::log_with(Kind::Pull, format!("Pulled {}", model));
                    }
                }
                self.session.apply_event(&event);
                Task::none()
            }
            Message::PageReady(page) => {
                match &page.error {
                    Some(e) => progress::log_with(Kind::Error, format!("\"{}\" failed: {}", page.topic, e)),
                    None => {
                        let found = page.images.iter().filter(|img| !img.is_placeholder()).count();
                        progress::log_with(
                            Kind::Images,
                            format!("\"{}\" ready, {}/{} images found", page.topic, found, page.images.len()),
                        );
                    }
                }
                let delivered = self.session.deliver(page);
                if delivered.is_some() && delivered == self.session.active() {
                    self.load_source();
                }
                Task::none()
            }
            Message::Reroll => {
                let Some(key) = self.session.active() else {
                    return Task::none();
                };
                match self.session.reroll_request(key, &self.model) {
                    Some(request) => self.run_generation(key, request),
                    None => Task::none(),
                }
            }
            Message::FollowLink(href) => {
                let request = self
                    .session
                    .active()
                    .and_then(|key| self.session.link_request(key, &href, &self.model));
                match request {
                    Some(request) => self.generate(request),
                    None => Task::none(),
                }
            }
            Message::ChatChanged(value) => {
                self.chat_input = value;
                Task::none()
            }
            Message::ChatSubmit => {
                let Some(key) = self.session.active() else {
                    return Task::none();
                };
                let Some(request) = self.session.edit_request(key, &self.model, &self.chat_input) else {
                    return Task::none();
                };
                self.chat_input.clear();
                self.session.begin_edit(key, &request);
                progress::log_with(Kind::Request, format!("Editing \"{}\": {}", request.topic, request.instruction));

                let (tx, rx) = mpsc::unbounded_channel();
                let generator = self.generator.clone();
                let page = Task::perform(
                    async move { generator.edit(&request, Some(tx)).await },
                    Message::PageReady,
                );
                Task::batch([follow_events(rx), page])
            }
            Message::CopyHtml => match self.session.active_tab().and_then(|t| t.page()) {
                Some(page) => clipboard::write(page.html.clone()),
                None => Task::none(),
            },
            Message::SavePage => {
                let Some(page) = self.session.active_tab().and_then(|t| t.page()) else {
                    return Task::none();
                };
                let (dir, topic, html) = (self.pages_dir.clone(), page.topic.clone(), page.html.clone());
                Task::perform(
                    async move {
                        browser::save_page(&dir, &topic, &html)
                            .await
                            .map_err(|e| format!("{:#}", e))
                    },
                    Message::PageSaved,
                )
            }
            Message::PageSaved(Ok(path)) => {
                progress::log(format!("Saved {}", path.display()));
                Task::none()
            }
            Message::PageSaved(Err(e)) => {
                tracing::error!("saving page failed: {}", e);
                progress::log_with(Kind::Error, format!("Save failed: {}", e));
                Task::none()
            }
            Message::AddBookmark => {
                let Some(tab) = self.session.active_tab() else {
                    return Task::none();
                };
                let replacing = self.bookmarks.get(&tab.title).is_some();
                if self.bookmarks.add(&tab.title, &tab.address()) {
                    let verb = if replacing { "Updated" } else { "Added" };
                    progress::log(format!("{} bookmark \"{}\"", verb, tab.title));
                    if let Err(e) = self.bookmarks.save() {
                        tracing::error!("saving bookmarks failed: {:#}", e);
                        progress::log_with(Kind::Error, format!("Could not save bookmarks: {:#}", e));
                    }
                }
                Task::none()
            }
            Message::OpenBookmark(url) => match parse_address(&url) {
                Some(topic) => self.generate(GenerationRequest::new(topic, self.model.clone())),
                None => Task::none(),
            },
            Message::DeleteBookmark(label) => {
                if self.bookmarks.remove(&label).is_some() {
                    if let Err(e) = self.bookmarks.save() {
                        tracing::error!("saving bookmarks failed: {:#}", e);
                        progress::log_with(Kind::Error, format!("Could not save bookmarks: {:#}", e));
                    }
                }
                Task::none()
            }
            Message::ToggleBookmarks => {
                self.show_bookmarks = !self.show_bookmarks;
                Task::none()
            }
            Message::ToggleSource => {
                self.show_source = !self.show_source;
                if self.show_source {
                    self.load_source();
                }
                Task::none()
            }
            Message::SourceEdited(action) => {
                self.source.perform(action);
                Task::none()
            }
            Message::ApplySource => {
                let Some(key) = self.session.active() else {
                    return Task::none();
                };
                if self.session.apply_source(key, &self.source.text()) {
                    if let Some(tab) = self.session.tab(key) {
                        progress::log(format!("Applied source changes to \"{}\"", tab.title));
                    }
                }
                Task::none()
            }
            Message::RevertSource => {
                self.load_source();
                Task::none()
            }
            Message::ToggleTheme => {
                self.dark_mode = !self.dark_mode;
                Task::none()
            }
            Message::ClearLog => {
                progress::clear();
                Task::none()
            }
            Message::Escape => {
                self.show_bookmarks = false;
                Task::none()
            }
            Message::Tick => {
                self.loading_frame = self.loading_frame.wrapping_add(1);
                Task::none()
            }
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        let timer = if self.session.loading_count() > 0 {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        };

        let events = event::listen_with(|event, _status, _id| {
            if let IcedEvent::Keyboard(keyboard::Event::KeyPressed {
                key: Key::Named(keyboard::key::Named::Escape),
                ..
            }) = event
            {
                Some(Message::Escape)
            } else {
                None
            }
        });

        Subscription::batch([timer, events])
    }

    fn view(&self) -> Element<Message> {
        let address = text_input("Type a topic, e.g. coffee roasting.gen", &self.address)
            .on_input(Message::AddressChanged)
            .on_submit(Message::Submit)
            .padding(10)
            .size(16)
            .id(self.address_id.clone());

        let toolbar = row![
            address,
            pick_list(self.models.as_slice(), Some(&self.model), Message::ModelSelected),
            button(text("Go")).on_press(Message::Submit).padding(10),
            button(text("☆")).on_press(Message::AddBookmark).padding(10).style(button::secondary),
            button(text("Bookmarks")).on_press(Message::ToggleBookmarks).padding(10).style(button::secondary),
            button(text(if self.dark_mode { "Light" } else { "Dark" }))
                .on_press(Message::ToggleTheme)
                .padding(10)
                .style(button::secondary),
        ]
        .spacing(8)
        .align_y(alignment::Vertical::Center);

        let body: Element<Message> = if self.show_bookmarks {
            self.bookmarks_view()
        } else {
            match self.session.active_tab() {
                None => self.home_view(),
                Some(tab) => match &tab.state {
                    TabState::Loading { stage, pull } => self.loading_view(stage.label(), pull.as_ref()),
                    TabState::Ready(page) => self.page_view(tab, page),
                },
            }
        };

        container(column![toolbar, self.tab_strip(), body].spacing(10).padding(10))
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn tab_strip(&self) -> Element<Message> {
        let home_style = if self.session.active().is_none() { button::primary } else { button::secondary };
        let mut strip = row![button(text("Home").size(14)).on_press(Message::SelectTab(None)).style(home_style)].spacing(4);

        for tab in self.session.tabs() {
            let style = if self.session.active() == Some(tab.key) { button::primary } else { button::secondary };
            let mut title: String = tab.title.chars().take(24).collect();
            if tab.is_loading() {
                title = format!("{} {}", SPINNER_FRAMES[self.loading_frame % SPINNER_FRAMES.len()], title);
            }
            strip = strip.push(
                row![
                    button(text(title).size(14)).on_press(Message::SelectTab(Some(tab.key))).style(style),
                    button(text("×").size(14)).on_press(Message::CloseTab(tab.key)).style(button::text),
                ]
                .spacing(0),
            );
        }

        scrollable(strip)
            .direction(scrollable::Direction::Horizontal(scrollable::Scrollbar::default()))
            .into()
    }

    fn home_view(&self) -> Element<Message> {
        let mut log = Column::new().spacing(4);
        for entry in progress::recent(50).into_iter().rev() {
            let color = match entry.kind {
                Kind::Info => None,
                Kind::Request => Some(Color::from_rgb(0.45, 0.65, 1.0)),
                Kind::Pull => Some(Color::from_rgb(0.9, 0.7, 0.3)),
                Kind::Images => Some(Color::from_rgb(0.4, 0.8, 0.5)),
                Kind::Error => Some(Color::from_rgb(0.95, 0.4, 0.4)),
            };
            let line = text(entry.text).size(14);
            log = log.push(match color {
                Some(color) => line.color(color),
                None => line,
            });
        }

        column![
            text("Gen Browser").size(28),
            row![
                text("Every page is written on demand by a local model. Type a topic above to begin.").size(15),
                horizontal_space(),
                button(text("Clear log").size(13)).on_press(Message::ClearLog).style(button::secondary),
            ]
            .align_y(alignment::Vertical::Center),
            scrollable(container(log).padding(10).width(Length::Fill)).height(Length::Fill),
        ]
        .spacing(12)
        .into()
    }

    fn loading_view(&self, label: &str, pull: Option<&(String, f32)>) -> Element<Message> {
        let spinner = SPINNER_FRAMES[self.loading_frame % SPINNER_FRAMES.len()];
        let mut content = column![text(spinner).size(32), text(label.to_string()).size(15)]
            .spacing(10)
            .align_x(alignment::Horizontal::Center);

        if let Some((model, fraction)) = pull {
            content = content
                .push(text(format!("Pulling {}: {:.0}%", model, fraction * 100.0)).size(14))
                .push(progress_bar(0.0..=1.0, *fraction).width(Length::Fixed(320.0)));
        }

        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .align_x(alignment::Horizontal::Center)
            .align_y(alignment::Vertical::Center)
            .into()
    }

    fn page_view<'a>(&'a self, tab: &'a browser::Tab, page: &'a GeneratedPage) -> Element<'a, Message> {
        let actions = row![
            text(&tab.title).size(22),
            horizontal_space(),
            button(text("Reroll").size(14)).on_press(Message::Reroll),
            button(text("Copy HTML").size(14)).on_press(Message::CopyHtml).style(button::secondary),
            button(text("Save").size(14)).on_press(Message::SavePage).style(button::secondary),
            button(text(if self.show_source { "Hide source" } else { "Source" }).size(14))
                .on_press(Message::ToggleSource)
                .style(button::secondary),
        ]
        .spacing(8)
        .align_y(alignment::Vertical::Center);

        let mut details = Column::new().spacing(6);
        if let Some(error) = &page.error {
            details = details.push(text(error).size(15).color(Color::from_rgb(0.95, 0.4, 0.4)));
        }

        if !tab.links.is_empty() {
            details = details.push(text("Links").size(16));
            for link in &tab.links {
                details = details.push(
                    button(text(format!("{}  ({})", link.text, link.href)).size(14))
                        .on_press(Message::FollowLink(link.href.clone()))
                        .style(button::text),
                );
            }
        }

        if !page.images.is_empty() {
            details = details.push(text("Images").size(16));
            for image in &page.images {
                let status = if image.is_placeholder() { "no match" } else { image.url.as_str() };
                details = details.push(text(format!("{}: {}", image.query, status)).size(13));
            }
        }

        let main: Element<'a, Message> = if self.show_source {
            column![
                text_editor(&self.source)
                    .on_action(Message::SourceEdited)
                    .font(Font::MONOSPACE)
                    .size(12)
                    .height(Length::Fill),
                row![
                    button(text("Apply changes").size(14)).on_press(Message::ApplySource),
                    button(text("Revert").size(14)).on_press(Message::RevertSource).style(button::secondary),
                ]
                .spacing(8),
            ]
            .spacing(8)
            .height(Length::Fill)
            .into()
        } else {
            scrollable(container(details).padding(10).width(Length::Fill))
                .height(Length::Fill)
                .into()
        };

        let mut transcript = Column::new().spacing(4);
        for turn in &tab.chat {
            let line = text(format!("{}: {}", turn.speaker.label(), turn.text)).size(14);
            transcript = transcript.push(match turn.speaker {
                Speaker::User => line,
                Speaker::Assistant => line.color(Color::from_rgb(0.45, 0.65, 1.0)),
            });
        }

        let chat = text_input("Ask the assistant to change this page...", &self.chat_input)
            .on_input(Message::ChatChanged)
            .on_submit(Message::ChatSubmit)
            .padding(10)
            .size(15);

        let mut content = column![actions, main].spacing(10);
        if !tab.chat.is_empty() {
            content = content.push(
                scrollable(container(transcript).padding(6).width(Length::Fill))
                    .anchor_bottom()
                    .height(Length::Fixed(120.0)),
            );
        }

        content
            .push(row![chat, button(text("Send")).on_press(Message::ChatSubmit).padding(10)].spacing(8))
            .into()
    }

    fn bookmarks_view(&self) -> Element<Message> {
        let mut list = Column::new().spacing(6);
        if self.bookmarks.is_empty() {
            list = list.push(text("No bookmarks yet. Open a page and press ☆.").size(14));
        }
        for (label, url) in self.bookmarks.iter() {
            list = list.push(
                row![
                    button(text(format!("{}  ({})", label, url)).size(14))
                        .on_press(Message::OpenBookmark(url.to_string()))
                        .style(button::text),
                    horizontal_space(),
                    button(text("Delete").size(13))
                        .on_press(Message::DeleteBookmark(label.to_string()))
                        .style(button::danger),
                ]
                .align_y(alignment::Vertical::Center),
            );
        }

        column![
            text("Bookmarks").size(22),
            text(self.bookmarks.path().display().to_string()).size(12),
            scrollable(container(list).padding(10).width(Length::Fill)).height(Length::Fill),
        ]
        .spacing(10)
        .into()
    }

    fn theme(&self) -> Theme {
        if self.dark_mode {
            Theme::TokyoNight
        } else {
            Theme::Light
        }
    }
}
