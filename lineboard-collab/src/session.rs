//! Editing session for one board.
//!
//! A [`BoardSession`] is the single owner of user-driven mutations. Each
//! displayed line gets a [`LineHandle`]; handles never touch the store,
//! they post [`LineAction`]s which the session applies in order.
//!
//! The store lock is only taken for short synchronous steps; it is never
//! held while the authority is answering, so inbound merges and flushes
//! keep running during a slow create or delete.
//!
//! ```text
//! LineHandle ──(id, LineAction)──► mpsc ──► BoardSession::process_actions
//!                                                 │
//!                           ┌─────────────────────┼──────────────────┐
//!                           ▼                     ▼                  ▼
//!                     LineAuthority          LineStore        PreferenceStore
//! ```

use std::collections::HashMap;

use lineboard_core::{
    BoardError, ContentSnapshot, ContentType, LineAuthority, LineId, LineRecord,
    MemoryPreferences, MergeOutcome, Position, PreferenceStore, RenderSurface, StorageKeys,
};
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, SharedStore};

/// Something a line asks its session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAction {
    /// Insert a new line right after this one.
    AppendLine,
    /// The author changed the text.
    Changed(String),
    Focus(bool),
    Delete,
    SetEditMode(bool),
    SetContentType(ContentType),
}

/// Capability handed to the presentation of one line.
#[derive(Debug, Clone)]
pub struct LineHandle {
    id: LineId,
    tx: mpsc::UnboundedSender<(LineId, LineAction)>,
}

impl LineHandle {
    pub fn id(&self) -> &LineId {
        &self.id
    }

    pub fn append_line(&self) {
        self.post(LineAction::AppendLine);
    }

    pub fn changed_line(&self, text: impl Into<String>) {
        self.post(LineAction::Changed(text.into()));
    }

    pub fn focus_on_line(&self, focused: bool) {
        self.post(LineAction::Focus(focused));
    }

    pub fn delete(&self) {
        self.post(LineAction::Delete);
    }

    pub fn set_edit_mode(&self, on: bool) {
        self.post(LineAction::SetEditMode(on));
    }

    pub fn set_content_type(&self, content_type: ContentType) {
        self.post(LineAction::SetContentType(content_type));
    }

    fn post(&self, action: LineAction) {
        if self.tx.send((self.id.clone(), action)).is_err() {
            log::debug!("Session gone, dropping action for line {}", self.id);
        }
    }
}

/// An action that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub id: LineId,
    pub action: LineAction,
    pub error: BoardError,
}

/// User-facing operations on one board.
pub struct BoardSession<A: LineAuthority> {
    store: SharedStore,
    authority: A,
    keys: StorageKeys,
    preferences: Box<dyn PreferenceStore + Send>,
    /// One surface per displayed line.
    surfaces: HashMap<LineId, Box<dyn RenderSurface + Send>>,
    /// A created line whose position has not reached the store yet.
    pending_focus: Option<LineId>,
    action_tx: mpsc::UnboundedSender<(LineId, LineAction)>,
    action_rx: mpsc::UnboundedReceiver<(LineId, LineAction)>,
}

impl<A: LineAuthority> BoardSession<A> {
    pub fn new(board_id: impl Into<String>, store: SharedStore, authority: A) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        Self {
            store,
            authority,
            keys: StorageKeys::new(board_id),
            preferences: Box::new(MemoryPreferences::default()),
            surfaces: HashMap::new(),
            pending_focus: None,
            action_tx,
            action_rx,
        }
    }

    pub fn with_preferences(mut self, preferences: impl PreferenceStore + Send + 'static) -> Self {
        self.preferences = Box::new(preferences);
        self
    }

    /// Route rendering of line `id` to `surface`, replacing any previous one.
    pub fn attach_surface(&mut self, id: LineId, surface: impl RenderSurface + Send + 'static) {
        self.surfaces.insert(id, Box::new(surface));
    }

    pub fn detach_surface(&mut self, id: &LineId) -> bool {
        self.surfaces.remove(id).is_some()
    }

    /// Line waiting for its position before it can take focus.
    pub fn pending_focus(&self) -> Option<&LineId> {
        self.pending_focus.as_ref()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub fn line_handle(&self, id: LineId) -> LineHandle {
        LineHandle {
            id,
            tx: self.action_tx.clone(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Operations
    // ───────────────────────────────────────────────────────────────

    /// Insert an empty line after `parent`, or after the focused line, or
    /// after the last line.
    ///
    /// The new line takes the anchor's content type, receives focus and
    /// opens in edit mode; the anchor leaves edit mode. When the authority
    /// answers before the line reaches the store, focus follows once
    /// [`handle_event`](Self::handle_event) sees it arrive.
    pub async fn append_line(&mut self, parent: Option<LineId>) -> Result<LineId, BoardError> {
        let (anchor, content_type) = {
            let store = self.store.lock().await;
            let anchor = parent.or_else(|| store.insertion_anchor().cloned());
            let content_type = anchor
                .as_ref()
                .and_then(|id| store.get(id))
                .and_then(|record| record.content.content_type)
                .unwrap_or_default();
            (anchor, content_type)
        };

        let snapshot = ContentSnapshot::new("", content_type);
        let placement = self
            .authority
            .assign_and_insert(anchor.clone(), snapshot.clone())
            .await?;
        let id = placement.id.clone();
        {
            let mut store = self.store.lock().await;
            placement.apply(&mut store, snapshot)?;
            if store.contains(&id) {
                store.focus_changed(&id, true);
            } else {
                log::debug!("Line {id} assigned, waiting for its position");
                self.pending_focus = Some(id.clone());
            }
        }

        if let Some(anchor) = anchor {
            self.set_edit_mode(&anchor, false);
        }
        self.set_edit_mode(&id, true);
        log::debug!("Appended line {id}");
        Ok(id)
    }

    /// Ask the authority to remove a line. Resolves to whether it did.
    pub async fn delete_line(&mut self, id: &LineId) -> Result<bool, BoardError> {
        let removed = self.authority.remove(id.clone()).await?;
        if !removed {
            log::debug!("Removal of line {id} refused");
            return Ok(false);
        }
        // A remote delete may already have been merged; this is then a no-op.
        self.store
            .lock()
            .await
            .upsert_or_move(id.clone(), Some(Position::Delete), None)?;
        self.surfaces.remove(id);
        Ok(true)
    }

    /// Record new text typed into a line and preview it.
    pub async fn edit_line(&mut self, id: &LineId, text: impl Into<String>) -> Result<u64, BoardError> {
        let snapshot = ContentSnapshot {
            value: Some(text.into()),
            ..ContentSnapshot::default()
        };
        self.apply_local(id, snapshot).await
    }

    pub async fn set_content_type(
        &mut self,
        id: &LineId,
        content_type: ContentType,
    ) -> Result<u64, BoardError> {
        let snapshot = ContentSnapshot {
            content_type: Some(content_type),
            ..ContentSnapshot::default()
        };
        self.apply_local(id, snapshot).await
    }

    async fn apply_local(&mut self, id: &LineId, snapshot: ContentSnapshot) -> Result<u64, BoardError> {
        let mut store = self.store.lock().await;
        let timestamp = store.edit_line(id, snapshot)?;
        if let Some(record) = store.get(id) {
            render(&mut self.surfaces, record);
        }
        Ok(timestamp)
    }

    pub async fn focus_changed(&mut self, id: &LineId, focused: bool) {
        self.store.lock().await.focus_changed(id, focused);
    }

    /// Remember whether a line shows its source or its rendering.
    pub fn set_edit_mode(&mut self, id: &LineId, on: bool) {
        self.preferences.set(&self.keys.key(id), on);
    }

    pub fn edit_mode(&self, id: &LineId) -> bool {
        self.preferences.get(&self.keys.key(id)).unwrap_or(false)
    }

    // ───────────────────────────────────────────────────────────────
    // Dispatch
    // ───────────────────────────────────────────────────────────────

    pub async fn handle_action(&mut self, id: LineId, action: LineAction) -> Result<(), BoardError> {
        match action {
            LineAction::AppendLine => self.append_line(Some(id)).await.map(|_| ()),
            LineAction::Changed(text) => self.edit_line(&id, text).await.map(|_| ()),
            LineAction::Focus(focused) => {
                self.focus_changed(&id, focused).await;
                Ok(())
            }
            LineAction::Delete => self.delete_line(&id).await.map(|_| ()),
            LineAction::SetEditMode(on) => {
                self.set_edit_mode(&id, on);
                Ok(())
            }
            LineAction::SetContentType(content_type) => {
                self.set_content_type(&id, content_type).await.map(|_| ())
            }
        }
    }

    /// Apply every queued action in arrival order. Failures do not stop
    /// later actions and are returned to the caller.
    pub async fn process_actions(&mut self) -> Vec<ActionFailure> {
        let mut failures = Vec::new();
        while let Ok((id, action)) = self.action_rx.try_recv() {
            if let Err(error) = self.handle_action(id.clone(), action.clone()).await {
                log::warn!("Action {action:?} on line {id} failed: {error}");
                failures.push(ActionFailure { id, action, error });
            }
        }
        failures
    }

    /// React to a channel event: remote content is pushed to the line's
    /// surface and a line created by this session takes focus on arrival.
    pub async fn handle_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::RemoteApplied { id, outcome } => {
                let mut store = self.store.lock().await;
                if self.pending_focus.as_ref() == Some(id) && store.contains(id) {
                    self.pending_focus = None;
                    store.focus_changed(id, true);
                }
                match outcome {
                    MergeOutcome::Applied { content_applied: true, .. } => {
                        if let Some(record) = store.get(id) {
                            render(&mut self.surfaces, record);
                        }
                    }
                    MergeOutcome::Deleted => {
                        self.surfaces.remove(id);
                    }
                    _ => {}
                }
            }
            ChannelEvent::ClosedAbnormally { reason } => {
                log::warn!("Board connection lost: {reason}");
            }
            _ => {}
        }
    }

    /// The board as an ordered JSON array of `{value, contentType}`.
    pub async fn export_json(&self) -> Result<String, serde_json::Error> {
        self.store.lock().await.to_json()
    }
}

fn render(surfaces: &mut HashMap<LineId, Box<dyn RenderSurface + Send>>, record: &LineRecord) {
    if let Some(surface) = surfaces.get_mut(&record.id) {
        surface.render(
            record.content.value.as_deref().unwrap_or_default(),
            record.content.content_type.unwrap_or_default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, Outbound, SyncChannel};
    use crate::protocol::ProtocolError;
    use lineboard_core::{LineStore, LocalAuthority, OrderKeySpace, Placement};
    use std::future::{ready, Future};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    #[derive(Clone, Default)]
    struct RecordingSurface {
        rendered: Arc<StdMutex<Vec<(String, ContentType)>>>,
    }

    impl RenderSurface for RecordingSurface {
        fn render(&mut self, content: &str, content_type: ContentType) {
            self.rendered.lock().unwrap().push((content.to_string(), content_type));
        }
    }

    /// Hands out `remote-n` ids, each only after the gate is opened. The
    /// position is left for a later store update.
    struct GatedAuthority {
        gate: Arc<Notify>,
        issued: u32,
    }

    impl LineAuthority for GatedAuthority {
        fn assign_and_insert(
            &mut self,
            _parent: Option<LineId>,
            _snapshot: ContentSnapshot,
        ) -> impl Future<Output = Result<Placement, BoardError>> + Send {
            self.issued += 1;
            let id = LineId::from(format!("remote-{}", self.issued));
            let gate = self.gate.clone();
            async move {
                gate.notified().await;
                Ok(Placement::pending(id))
            }
        }

        fn remove(&mut self, _id: LineId) -> impl Future<Output = Result<bool, BoardError>> + Send {
            ready(Ok(true))
        }
    }

    struct NullOutbound;

    impl Outbound for NullOutbound {
        fn buffered_amount(&self) -> usize {
            0
        }

        fn send(&self, _text: String) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn gated_session() -> (BoardSession<GatedAuthority>, Arc<Notify>) {
        let mut store = LineStore::new();
        store
            .upsert_or_move("first".into(), Some(Position::At(0)), None)
            .unwrap();
        let gate = Arc::new(Notify::new());
        let authority = GatedAuthority {
            gate: gate.clone(),
            issued: 0,
        };
        let session = BoardSession::new("demoboard", Arc::new(Mutex::new(store)), authority);
        (session, gate)
    }

    async fn session() -> (BoardSession<LocalAuthority>, LineId) {
        let store: SharedStore = Arc::new(Mutex::new(LineStore::new()));
        let mut authority = LocalAuthority::new(OrderKeySpace::default());
        let first = {
            let mut guard = store.lock().await;
            authority
                .insert_now(&mut guard, None, ContentSnapshot::new("", ContentType::Katex))
                .unwrap()
        };
        (BoardSession::new("demoboard", store, authority), first)
    }

    #[tokio::test]
    async fn test_append_after_last_inherits_content_type() {
        let (mut session, first) = session().await;
        let id = session.append_line(None).await.unwrap();

        let store = session.store().lock().await;
        let record = store.get(&id).unwrap();
        assert_eq!(record.order, 214_748);
        assert_eq!(record.content.content_type, Some(ContentType::Katex));
        assert_eq!(record.content.value.as_deref(), Some(""));
        assert_eq!(store.active_line(), Some(&id));
        drop(store);

        assert!(session.edit_mode(&id));
        assert!(!session.edit_mode(&first));
    }

    #[tokio::test]
    async fn test_append_goes_after_focused_line() {
        let (mut session, first) = session().await;
        let second = session.append_line(None).await.unwrap();
        session.focus_changed(&first, true).await;
        let middle = session.append_line(None).await.unwrap();

        let store = session.store().lock().await;
        let order: Vec<_> = store.ordered().map(|r| r.id.clone()).collect();
        assert_eq!(order, vec![first, middle.clone(), second.clone()]);
        assert_eq!(store.get(&middle).unwrap().order, 107_374);
        assert_eq!(store.last_line(), Some(&second));
    }

    #[tokio::test]
    async fn test_edit_marks_dirty_and_renders() {
        let (mut session, first) = session().await;
        let surface = RecordingSurface::default();
        session.attach_surface(first.clone(), surface.clone());

        let ts1 = session.edit_line(&first, "x^2").await.unwrap();
        let ts2 = session.set_content_type(&first, ContentType::AsciiMath).await.unwrap();
        assert!(ts2 > ts1);

        let mut store = session.store().lock().await;
        assert!(store.is_dirty(&first));
        let changes = store.drain_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1.value.as_deref(), Some("x^2"));
        drop(store);

        let rendered = surface.rendered.lock().unwrap().clone();
        assert_eq!(
            rendered,
            vec![
                ("x^2".to_string(), ContentType::Katex),
                ("x^2".to_string(), ContentType::AsciiMath),
            ]
        );
    }

    #[tokio::test]
    async fn test_each_line_renders_to_its_own_surface() {
        let (mut session, first) = session().await;
        let second = session.append_line(None).await.unwrap();
        let first_surface = RecordingSurface::default();
        let second_surface = RecordingSurface::default();
        session.attach_surface(first.clone(), first_surface.clone());
        session.attach_surface(second.clone(), second_surface.clone());

        session.edit_line(&first, "a").await.unwrap();
        session.edit_line(&second, "b").await.unwrap();
        session.edit_line(&first, "aa").await.unwrap();

        let texts = |surface: &RecordingSurface| -> Vec<String> {
            surface.rendered.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        };
        assert_eq!(texts(&first_surface), vec!["a", "aa"]);
        assert_eq!(texts(&second_surface), vec!["b"]);

        assert!(session.detach_surface(&second));
        session.edit_line(&second, "bb").await.unwrap();
        assert_eq!(texts(&second_surface), vec!["b"]);
    }

    #[tokio::test]
    async fn test_edit_unknown_line_fails() {
        let (mut session, _) = session().await;
        let err = session.edit_line(&LineId::Local(42), "a").await.unwrap_err();
        assert_eq!(err, BoardError::LineNotFound(LineId::Local(42)));
    }

    #[tokio::test]
    async fn test_delete_keeps_last_line() {
        let (mut session, first) = session().await;
        assert!(!session.delete_line(&first).await.unwrap());
        let second = session.append_line(None).await.unwrap();
        assert!(session.delete_line(&second).await.unwrap());
        let store = session.store().lock().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_line(), None);
    }

    #[tokio::test]
    async fn test_handles_post_actions_in_order() {
        let (mut session, first) = session().await;
        let handle = session.line_handle(first.clone());
        handle.focus_on_line(true);
        handle.changed_line("a + b");
        handle.append_line();
        handle.set_edit_mode(false);

        let failures = session.process_actions().await;
        assert!(failures.is_empty());

        let store = session.store().lock().await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&first).unwrap().content.value.as_deref(), Some("a + b"));
        let new_line = store.active_line().cloned().unwrap();
        assert_ne!(new_line, first);
        drop(store);
        assert!(session.edit_mode(&new_line));
        assert!(!session.edit_mode(&first));
    }

    #[tokio::test]
    async fn test_failed_action_is_reported() {
        let (mut session, _) = session().await;
        let ghost = session.line_handle(LineId::Local(99));
        ghost.changed_line("lost");
        ghost.delete();

        let failures = session.process_actions().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].action, LineAction::Changed("lost".into()));
        assert_eq!(failures[0].error, BoardError::LineNotFound(LineId::Local(99)));
    }

    #[tokio::test]
    async fn test_edit_mode_defaults_off_and_is_per_board() {
        let (mut session, first) = session().await;
        assert!(!session.edit_mode(&first));
        session.set_edit_mode(&first, true);
        assert!(session.edit_mode(&first));

        let mut prefs = MemoryPreferences::default();
        prefs.set("otherboard/0", true);
        let session = session.with_preferences(prefs);
        assert!(!session.edit_mode(&first));
    }

    #[tokio::test]
    async fn test_remote_update_is_rendered() {
        let (mut session, first) = session().await;
        let second = session.append_line(None).await.unwrap();
        let surface = RecordingSurface::default();
        let other = RecordingSurface::default();
        session.attach_surface(first.clone(), surface.clone());
        session.attach_surface(second.clone(), other.clone());

        let outcome = session
            .store()
            .lock()
            .await
            .merge_remote(
                first.clone(),
                Some(Position::At(0)),
                Some(ContentSnapshot::new("\\frac{1}{2}", ContentType::Katex).with_timestamp(4)),
            )
            .unwrap();
        session
            .handle_event(&ChannelEvent::RemoteApplied { id: first.clone(), outcome })
            .await;
        session.handle_event(&ChannelEvent::Opened).await;

        assert_eq!(
            surface.rendered.lock().unwrap().as_slice(),
            &[("\\frac{1}{2}".to_string(), ContentType::Katex)]
        );
        assert!(other.rendered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_stays_usable_while_authority_answers() {
        let (session, gate) = gated_session();
        let store = session.store().clone();
        let (channel, _events) = SyncChannel::new(store.clone(), NullOutbound, ChannelConfig::default());

        let append = tokio::spawn(async move {
            let mut session = session;
            let result = session.append_line(None).await;
            (session, result)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!append.is_finished());

        // The relay's placement arrives on the sync socket before the reply.
        let merged = tokio::time::timeout(
            Duration::from_millis(500),
            channel.handle_inbound(r#"{"id":"remote-1","number":10,"value":""}"#),
        )
        .await
        .expect("inbound merge must not wait for the authority");
        assert!(merged.is_some());
        store.lock().await.edit_line(&"first".into(), ContentSnapshot::default()).unwrap();
        tokio::time::timeout(Duration::from_millis(500), channel.flush_tick())
            .await
            .expect("flush must not wait for the authority")
            .unwrap();

        gate.notify_one();
        let (session, result) = append.await.unwrap();
        let id = result.unwrap();
        assert_eq!(id, LineId::from("remote-1"));
        assert_eq!(session.store().lock().await.active_line(), Some(&id));
        assert!(session.pending_focus().is_none());
    }

    #[tokio::test]
    async fn test_focus_follows_late_placement() {
        let (mut session, gate) = gated_session();
        gate.notify_one();
        let id = session.append_line(None).await.unwrap();
        assert_eq!(session.pending_focus(), Some(&id));
        assert!(session.store().lock().await.active_line().is_none());
        assert!(session.edit_mode(&id));

        let outcome = session
            .store()
            .lock()
            .await
            .merge_remote(id.clone(), Some(Position::At(10)), None)
            .unwrap();
        session
            .handle_event(&ChannelEvent::RemoteApplied { id: id.clone(), outcome })
            .await;

        assert!(session.pending_focus().is_none());
        assert_eq!(session.store().lock().await.active_line(), Some(&id));
    }

    #[tokio::test]
    async fn test_accepted_delete_leaves_store() {
        let (mut session, _gate) = gated_session();
        assert!(session.delete_line(&"first".into()).await.unwrap());
        assert!(session.store().lock().await.is_empty());
        // Already gone when the relayed delete arrives.
        assert!(session.delete_line(&"first".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_json() {
        let (mut session, first) = session().await;
        session.edit_line(&first, "1").await.unwrap();
        let second = session.append_line(None).await.unwrap();
        session.edit_line(&second, "2").await.unwrap();
        assert_eq!(
            session.export_json().await.unwrap(),
            r#"[{"value":"1","contentType":"katex"},{"value":"2","contentType":"katex"}]"#
        );
    }
}
