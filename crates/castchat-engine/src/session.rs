//! Chat session: thread store, gallery and roster behind one lock, plus the
//! message dispatcher that talks to the chat and image providers.
//!
//! The state lock is never held across a provider call. Each thread has at
//! most one dispatch in flight; replies always land in the thread the
//! dispatch started on.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use castchat_contracts::chat::{build_context_window, generated_image_caption, parse_reply};
use castchat_contracts::events::{ActivityEvent, ActivityLog};
use castchat_contracts::roster::{placeholder_character, Character, PortraitRecord, Roster};
use castchat_contracts::storage::{FileKeyValueStore, LoadPolicy, Persistence};
use castchat_contracts::threads::{Gallery, GeneratedImage, Message, Thread, ThreadStore};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::providers::{
    build_chat_provider, build_image_provider, error_chain_text, pseudo_random_seed, ChatProvider,
    ChatRequest, ImageProvider, ImageRequest,
};
use crate::roster::{roster_source_from_config, RosterSource};

pub const CHAT_FAILURE_REPLY: &str =
    "Sorry, there was an error processing your message. Please try again.";
pub const IMAGE_FAILURE_REPLY: &str =
    "Sorry, there was an error generating the image. Please try again.";
pub const ROSTER_LOAD_ERROR: &str = "Failed to load characters";
pub const PORTRAIT_STYLE: &str = "anime";

const ERROR_TEXT_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BlankInput,
    NoActiveThread,
    /// Another dispatch for the same thread has not finished.
    InFlight,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub thread_id: String,
    /// Messages added to the thread, in order.
    pub appended: Vec<Message>,
    pub gallery_entry: Option<GeneratedImage>,
    pub chat_failed: bool,
    pub image_failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Dispatched(DispatchReport),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageReport {
    pub thread_id: Option<String>,
    pub appended: Vec<Message>,
    pub gallery_entry: Option<GeneratedImage>,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Skipped(SkipReason),
    Completed(ImageReport),
}

/// Everything a session needs, already built.
pub struct SessionParts {
    pub persistence: Persistence,
    pub load_policy: LoadPolicy,
    pub chat: Box<dyn ChatProvider>,
    pub image: Box<dyn ImageProvider>,
    pub roster_source: Option<Box<dyn RosterSource>>,
    pub activity: Option<ActivityLog>,
    pub generate_portraits: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    threads: ThreadStore,
    gallery: Gallery,
    roster: Roster,
    selected_character: Option<i64>,
    roster_error: Option<String>,
}

impl SessionState {
    fn character_for(&self, character_id: i64) -> Character {
        self.roster
            .resolve(character_id)
            .cloned()
            .unwrap_or_else(|| placeholder_character(character_id))
    }

    fn selected_or_first(&self) -> Option<&Character> {
        self.selected_character
            .and_then(|id| self.roster.find(id))
            .or_else(|| self.roster.first())
    }
}

pub struct ChatSession {
    state: Arc<Mutex<SessionState>>,
    persistence: Persistence,
    chat: Box<dyn ChatProvider>,
    image: Arc<dyn ImageProvider>,
    roster_source: Option<Arc<dyn RosterSource>>,
    in_flight: Mutex<HashSet<String>>,
    activity: Option<ActivityLog>,
    generate_portraits: bool,
    portrait_jobs: Mutex<Vec<JoinHandle<()>>>,
}

/// Releases a thread's dispatch slot when dropped.
struct InFlightGuard<'a> {
    slots: &'a Mutex<HashSet<String>>,
    thread_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.thread_id);
    }
}

/// Generates and stores a portrait off the caller's thread, then refreshes
/// the roster so the new image shows up.
struct PortraitJob {
    character: Character,
    image: Arc<dyn ImageProvider>,
    source: Arc<dyn RosterSource>,
    state: Arc<Mutex<SessionState>>,
    activity: Option<ActivityLog>,
}

impl PortraitJob {
    fn run(self) {
        if let Err(err) = self.generate() {
            warn!(
                character = %self.character.name,
                error = %error_chain_text(&err, ERROR_TEXT_LIMIT),
                "portrait generation failed"
            );
        }
    }

    fn generate(&self) -> Result<()> {
        let prompt = self.character.portrait_prompt();
        let seed = pseudo_random_seed();
        let url = self.image.generate(&ImageRequest {
            prompt: prompt.clone(),
            seed: Some(seed),
        })?;
        self.source.store_portrait(&PortraitRecord {
            character_id: self.character.characterid,
            url: url.clone(),
            prompt,
            style: PORTRAIT_STYLE.to_string(),
            seed,
        })?;
        info!(character = %self.character.name, "portrait stored");
        record_event(
            self.activity.as_ref(),
            ActivityEvent::PortraitStored {
                character_id: self.character.characterid,
                url,
            },
        );
        refresh_roster(&self.state, self.source.as_ref())?;
        Ok(())
    }
}

impl ChatSession {
    /// Hydrates persisted threads and gallery. The roster is not fetched
    /// until `load_characters` is called.
    pub fn open(parts: SessionParts) -> Result<Self> {
        let persisted = parts.persistence.load(parts.load_policy)?;
        let state = SessionState {
            threads: ThreadStore::from_threads(persisted.threads),
            gallery: Gallery::from_images(persisted.images),
            ..SessionState::default()
        };
        let session = Self {
            state: Arc::new(Mutex::new(state)),
            persistence: parts.persistence,
            chat: parts.chat,
            image: Arc::from(parts.image),
            roster_source: parts.roster_source.map(Arc::from),
            in_flight: Mutex::new(HashSet::new()),
            activity: parts.activity,
            generate_portraits: parts.generate_portraits,
            portrait_jobs: Mutex::new(Vec::new()),
        };
        {
            let state = session.state()?;
            info!(
                threads = state.threads.len(),
                images = state.gallery.len(),
                chat = session.chat.name(),
                image = session.image.name(),
                "session opened"
            );
            session.record(ActivityEvent::SessionStarted {
                threads: state.threads.len(),
                images: state.gallery.len(),
                reset_keys: persisted.reset_keys,
            });
        }
        Ok(session)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store = Arc::new(FileKeyValueStore::new(config.state_dir()));
        Self::open(SessionParts {
            persistence: Persistence::new(store),
            load_policy: config.load_policy,
            chat: build_chat_provider(config)?,
            image: build_image_provider(config)?,
            roster_source: roster_source_from_config(config),
            activity: config.events_path.as_ref().map(ActivityLog::new),
            generate_portraits: config.generate_portraits,
        })
    }

    pub fn chat_provider_name(&self) -> &str {
        self.chat.name()
    }

    pub fn image_provider_name(&self) -> &str {
        self.image.name()
    }

    /// Fetches the roster. A failed fetch leaves an empty roster and sets
    /// the roster error instead of failing.
    pub fn load_characters(&self) -> Result<usize> {
        match self.roster_source.as_deref() {
            Some(source) => refresh_roster(&self.state, source),
            None => Ok(0),
        }
    }

    pub fn characters(&self) -> Result<Vec<Character>> {
        Ok(self.state()?.roster.characters().to_vec())
    }

    pub fn roster_error(&self) -> Result<Option<String>> {
        Ok(self.state()?.roster_error.clone())
    }

    pub fn selected_character(&self) -> Result<Option<Character>> {
        Ok(self.state()?.selected_or_first().cloned())
    }

    /// Selects by id or case-insensitive name.
    pub fn select_character(&self, query: &str) -> Result<Option<Character>> {
        let mut state = self.state()?;
        let Some(found) = state.roster.lookup(query).cloned() else {
            return Ok(None);
        };
        state.selected_character = Some(found.characterid);
        Ok(Some(found))
    }

    /// The character that replies in the given thread.
    pub fn character_for_thread(&self, thread_id: &str) -> Result<Option<Character>> {
        let state = self.state()?;
        Ok(state
            .threads
            .get(thread_id)
            .map(|thread| state.character_for(thread.character_id)))
    }

    pub fn threads(&self) -> Result<Vec<Thread>> {
        Ok(self.state()?.threads.threads().to_vec())
    }

    pub fn active_thread(&self) -> Result<Option<Thread>> {
        Ok(self.state()?.threads.active().cloned())
    }

    pub fn gallery(&self) -> Result<Vec<GeneratedImage>> {
        Ok(self.state()?.gallery.images().to_vec())
    }

    /// Starts a thread with the selected character and makes it active. A
    /// character without a portrait gets one generated in the background.
    pub fn create_thread(&self) -> Result<Thread> {
        let (thread, character, from_roster) = {
            let mut state = self.state()?;
            let (character, from_roster) = match state.selected_or_first() {
                Some(character) => (character.clone(), true),
                None => (placeholder_character(0), false),
            };
            let mut threads = state.threads.clone();
            let thread = threads.create(&character);
            self.persistence.save_threads(threads.threads())?;
            state.threads = threads;
            (thread, character, from_roster)
        };
        info!(thread_id = %thread.id, character = %character.name, "thread created");
        self.record(ActivityEvent::ThreadCreated {
            thread_id: thread.id.clone(),
            character_id: character.characterid,
        });

        if from_roster && self.generate_portraits && !character.has_portrait() {
            self.spawn_portrait(character);
        }
        Ok(thread)
    }

    pub fn rename_thread(&self, thread_id: &str, name: &str) -> Result<bool> {
        let mut state = self.state()?;
        let renamed = self.commit_threads(&mut state, |threads| {
            threads.rename(thread_id, name).then_some(())
        })?;
        drop(state);
        if renamed.is_none() {
            return Ok(false);
        }
        self.record(ActivityEvent::ThreadRenamed {
            thread_id: thread_id.to_string(),
            name: name.trim().to_string(),
        });
        Ok(true)
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let deleted =
            self.commit_threads(&mut state, |threads| threads.delete(thread_id).then_some(()))?;
        drop(state);
        if deleted.is_none() {
            return Ok(false);
        }
        info!(thread_id, "thread deleted");
        self.record(ActivityEvent::ThreadDeleted {
            thread_id: thread_id.to_string(),
        });
        Ok(true)
    }

    pub fn select_thread(&self, thread_id: &str) -> Result<bool> {
        Ok(self.state()?.threads.select(thread_id))
    }

    pub fn delete_image(&self, created_at: i64) -> Result<bool> {
        let mut state = self.state()?;
        if state.gallery.get(created_at).is_none() {
            return Ok(false);
        }
        self.commit_gallery(&mut state, |gallery| gallery.remove(created_at))?;
        drop(state);
        self.record(ActivityEvent::ImageDeleted { created_at });
        Ok(true)
    }

    /// Sends `input` on the active thread and applies the reply, including
    /// an image directive if the reply carries one.
    pub fn send_message(&self, input: &str) -> Result<DispatchOutcome> {
        if input.trim().is_empty() {
            return Ok(DispatchOutcome::Skipped(SkipReason::BlankInput));
        }
        let Some(thread_id) = self.state()?.threads.active_id().map(str::to_string) else {
            return Ok(DispatchOutcome::Skipped(SkipReason::NoActiveThread));
        };
        let Some(_slot) = self.claim_thread(&thread_id) else {
            debug!(thread_id, "dispatch already in flight");
            return Ok(DispatchOutcome::Skipped(SkipReason::InFlight));
        };

        let user_message = Message::user(input);
        let (history, character) = {
            let mut state = self.state()?;
            let Some(thread) = state.threads.get(&thread_id) else {
                return Ok(DispatchOutcome::Skipped(SkipReason::NoActiveThread));
            };
            let history = thread.messages.clone();
            let character = state.character_for(thread.character_id);
            self.commit_threads(&mut state, |threads| {
                threads
                    .push_message(&thread_id, user_message.clone())
                    .then_some(())
            })?;
            (history, character)
        };

        let mut report = DispatchReport {
            thread_id: thread_id.clone(),
            appended: vec![user_message.clone()],
            ..DispatchReport::default()
        };
        let window = build_context_window(&character.persona_preamble(), &history, &user_message);
        let request = ChatRequest {
            persona: character.bio.clone(),
            messages: window,
        };

        let reply = match self.chat.complete(&request) {
            Ok(reply) => reply,
            Err(err) => {
                let error = error_chain_text(&err, ERROR_TEXT_LIMIT);
                warn!(thread_id, provider = self.chat.name(), error = %error, "chat request failed");
                self.record(ActivityEvent::DispatchFailed {
                    thread_id: thread_id.clone(),
                    error,
                });
                report.chat_failed = true;
                self.append_to_thread(
                    &thread_id,
                    Message::assistant(CHAT_FAILURE_REPLY),
                    &mut report.appended,
                )?;
                return Ok(DispatchOutcome::Dispatched(report));
            }
        };

        let parsed = parse_reply(&reply);
        self.record(ActivityEvent::MessageDispatched {
            thread_id: thread_id.clone(),
            context_turns: request.messages.len(),
            directive: parsed
                .directive
                .as_ref()
                .map(|directive| directive.prompt.clone()),
        });
        if !parsed.text.is_empty() {
            self.append_to_thread(
                &thread_id,
                Message::assistant(parsed.text.clone()),
                &mut report.appended,
            )?;
        }

        if let Some(directive) = parsed.directive {
            match self.image.generate(&ImageRequest::new(directive.prompt.clone())) {
                Ok(url) => {
                    let message = Message::assistant(generated_image_caption(&directive.prompt))
                        .with_image(url.clone());
                    let entry = {
                        let mut state = self.state()?;
                        let pushed = self.commit_threads(&mut state, |threads| {
                            threads
                                .push_message(&thread_id, message.clone())
                                .then_some(())
                        })?;
                        if pushed.is_some() {
                            report.appended.push(message);
                        }
                        self.commit_gallery(&mut state, |gallery| {
                            gallery.add(url.clone(), directive.prompt.clone())
                        })?
                    };
                    info!(thread_id, prompt = %directive.prompt, "image generated");
                    self.record(ActivityEvent::ImageGenerated {
                        thread_id: Some(thread_id.clone()),
                        prompt: directive.prompt,
                        url,
                        created_at: entry.created_at,
                    });
                    report.gallery_entry = Some(entry);
                }
                Err(err) => {
                    let error = error_chain_text(&err, ERROR_TEXT_LIMIT);
                    warn!(thread_id, provider = self.image.name(), error = %error, "image request failed");
                    self.record(ActivityEvent::ImageFailed {
                        thread_id: Some(thread_id.clone()),
                        prompt: directive.prompt,
                        error,
                    });
                    report.image_failed = true;
                    self.append_to_thread(
                        &thread_id,
                        Message::assistant(IMAGE_FAILURE_REPLY),
                        &mut report.appended,
                    )?;
                }
            }
        }
        Ok(DispatchOutcome::Dispatched(report))
    }

    /// Generates an image outside the chat flow. The gallery always gets
    /// the result; the active thread, if any, gets a request/response pair.
    pub fn generate_image(&self, prompt: &str) -> Result<ImageOutcome> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(ImageOutcome::Skipped(SkipReason::BlankInput));
        }
        let thread_id = self.state()?.threads.active_id().map(str::to_string);
        let _slot = match thread_id.as_deref() {
            Some(id) => match self.claim_thread(id) {
                Some(slot) => Some(slot),
                None => return Ok(ImageOutcome::Skipped(SkipReason::InFlight)),
            },
            None => None,
        };

        let mut report = ImageReport {
            thread_id: thread_id.clone(),
            ..ImageReport::default()
        };
        match self.image.generate(&ImageRequest::new(prompt)) {
            Ok(url) => {
                let mut state = self.state()?;
                let entry =
                    self.commit_gallery(&mut state, |gallery| gallery.add(url.clone(), prompt))?;
                if let Some(id) = thread_id.as_deref() {
                    let request = Message::user(format!("Generated image: {prompt}"));
                    let response =
                        Message::assistant(generated_image_caption(prompt)).with_image(url.clone());
                    let pushed = self.commit_threads(&mut state, |threads| {
                        (threads.push_message(id, request.clone())
                            && threads.push_message(id, response.clone()))
                        .then_some(())
                    })?;
                    if pushed.is_some() {
                        report.appended.extend([request, response]);
                    }
                }
                drop(state);
                info!(prompt, "image generated");
                self.record(ActivityEvent::ImageGenerated {
                    thread_id: thread_id.clone(),
                    prompt: prompt.to_string(),
                    url,
                    created_at: entry.created_at,
                });
                report.gallery_entry = Some(entry);
            }
            Err(err) => {
                let error = error_chain_text(&err, ERROR_TEXT_LIMIT);
                warn!(provider = self.image.name(), error = %error, "image request failed");
                self.record(ActivityEvent::ImageFailed {
                    thread_id: thread_id.clone(),
                    prompt: prompt.to_string(),
                    error,
                });
                report.failed = true;
                if let Some(id) = thread_id.as_deref() {
                    self.append_to_thread(
                        id,
                        Message::assistant(IMAGE_FAILURE_REPLY),
                        &mut report.appended,
                    )?;
                }
            }
        }
        Ok(ImageOutcome::Completed(report))
    }

    /// Blocks until every portrait started by `create_thread` has finished.
    pub fn wait_for_portraits(&self) {
        let jobs = mem::take(
            &mut *self
                .portrait_jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for job in jobs {
            if job.join().is_err() {
                warn!("portrait worker panicked");
            }
        }
    }

    fn spawn_portrait(&self, character: Character) {
        let Some(source) = self.roster_source.clone() else {
            return;
        };
        let name = character.name.clone();
        let job = PortraitJob {
            character,
            image: Arc::clone(&self.image),
            source,
            state: Arc::clone(&self.state),
            activity: self.activity.clone(),
        };
        match thread::Builder::new()
            .name("castchat-portrait".to_string())
            .spawn(move || job.run())
        {
            Ok(handle) => self
                .portrait_jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle),
            Err(err) => warn!(character = %name, error = %err, "portrait worker failed to start"),
        }
    }

    /// Appends to a thread that may have been deleted meanwhile; a missing
    /// thread drops the message.
    fn append_to_thread(
        &self,
        thread_id: &str,
        message: Message,
        appended: &mut Vec<Message>,
    ) -> Result<()> {
        let mut state = self.state()?;
        let pushed = self.commit_threads(&mut state, |threads| {
            threads.push_message(thread_id, message.clone()).then_some(())
        })?;
        if pushed.is_none() {
            debug!(thread_id, "thread gone; reply dropped");
            return Ok(());
        }
        appended.push(message);
        Ok(())
    }

    /// Applies `change` to a copy of the threads and keeps the copy only
    /// once it is saved. `None` from `change` means nothing changed.
    fn commit_threads<T>(
        &self,
        state: &mut SessionState,
        change: impl FnOnce(&mut ThreadStore) -> Option<T>,
    ) -> Result<Option<T>> {
        let mut threads = state.threads.clone();
        let Some(outcome) = change(&mut threads) else {
            return Ok(None);
        };
        self.persistence.save_threads(threads.threads())?;
        state.threads = threads;
        Ok(Some(outcome))
    }

    fn commit_gallery<T>(
        &self,
        state: &mut SessionState,
        change: impl FnOnce(&mut Gallery) -> T,
    ) -> Result<T> {
        let mut gallery = state.gallery.clone();
        let outcome = change(&mut gallery);
        self.persistence.save_gallery(gallery.images())?;
        state.gallery = gallery;
        Ok(outcome)
    }

    /// The slot set only ever holds whole ids, so a poisoned lock still
    /// guards a consistent set.
    fn claim_thread(&self, thread_id: &str) -> Option<InFlightGuard<'_>> {
        let mut slots = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !slots.insert(thread_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            slots: &self.in_flight,
            thread_id: thread_id.to_string(),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        lock_state(&self.state)
    }

    fn record(&self, event: ActivityEvent) {
        record_event(self.activity.as_ref(), event);
    }
}

fn lock_state(state: &Mutex<SessionState>) -> Result<MutexGuard<'_, SessionState>> {
    state
        .lock()
        .map_err(|_| anyhow!("session state lock poisoned"))
}

fn record_event(activity: Option<&ActivityLog>, event: ActivityEvent) {
    let Some(log) = activity else {
        return;
    };
    if let Err(err) = log.record(&event) {
        warn!(path = %log.path().display(), error = %err, "activity journal write failed");
    }
}

/// Fetches the roster. A failed fetch leaves an empty roster and sets the
/// roster error instead of failing.
fn refresh_roster(state: &Mutex<SessionState>, source: &dyn RosterSource) -> Result<usize> {
    let fetched = source.list_characters();
    let mut state = lock_state(state)?;
    match fetched {
        Ok(characters) => {
            state.roster = Roster::new(characters);
            state.roster_error = None;
            let selected = state
                .selected_or_first()
                .map(|character| character.characterid);
            state.selected_character = selected;
            let count = state.roster.characters().len();
            info!(source = source.name(), count, "roster loaded");
            Ok(count)
        }
        Err(err) => {
            warn!(
                source = source.name(),
                error = %error_chain_text(&err, ERROR_TEXT_LIMIT),
                "roster load failed"
            );
            state.roster = Roster::default();
            state.roster_error = Some(ROSTER_LOAD_ERROR.to_string());
            Ok(0)
        }
    }
}
