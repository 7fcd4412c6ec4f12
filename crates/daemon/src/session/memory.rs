//! In-memory session and PTY backends.
//!
//! These implement the same traits as the tmux-backed types without touching
//! any process. Tests drive them directly: emit output, end a process, make
//! the next create or spawn fail.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::SessionNamespace;

use super::pty::{
    ExitInfo, Generation, PtyError, PtyEvent, PtyEventSender, PtyHandle, PtySpawner, SpawnRequest,
};
use super::registry::{now_millis, RegistryError, Session, SessionRegistry};

/// Session registry kept in a map.
pub struct MemoryRegistry {
    namespace: SessionNamespace,
    working_dir: PathBuf,
    sessions: Mutex<BTreeMap<String, Session>>,
    fail_creates: AtomicBool,
    creates: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new(namespace: SessionNamespace) -> Self {
        Self {
            namespace,
            working_dir: PathBuf::from("/tmp"),
            sessions: Mutex::new(BTreeMap::new()),
            fail_creates: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
        }
    }

    /// Inserts a session directly, bypassing `create`.
    pub fn insert(&self, raw_name: &str) -> Result<Session, RegistryError> {
        let full_name = self.namespace.full_name(raw_name)?;
        let session = Session::new(
            &self.namespace,
            full_name.clone(),
            now_millis(),
            self.working_dir.clone(),
        );
        self.lock().insert(full_name, session.clone());
        Ok(session)
    }

    /// Makes every subsequent `create` fail until reset.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `create` calls.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Full names of every session, sorted.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(SessionNamespace::default())
    }
}

impl SessionRegistry for MemoryRegistry {
    fn namespace(&self) -> &SessionNamespace {
        &self.namespace
    }

    async fn list(&self) -> Result<Vec<Session>, RegistryError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn create(&self, raw_name: &str) -> Result<Session, RegistryError> {
        let full_name = self.namespace.full_name(raw_name)?;

        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RegistryError::CreationFailed(format!(
                "refusing to create {full_name}"
            )));
        }

        let mut sessions = self.lock();
        if sessions.contains_key(&full_name) {
            return Err(RegistryError::CreationFailed(format!(
                "duplicate session: {full_name}"
            )));
        }

        let session = Session::new(
            &self.namespace,
            full_name.clone(),
            now_millis(),
            self.working_dir.clone(),
        );
        sessions.insert(full_name, session.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn exists(&self, name: &str) -> bool {
        match self.namespace.full_name(name) {
            Ok(full_name) => self.lock().contains_key(&full_name),
            Err(_) => false,
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), RegistryError> {
        let full_name = self.namespace.full_name(name)?;
        self.lock()
            .remove(&full_name)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(full_name))
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<Session, RegistryError> {
        let old_full = self.namespace.full_name(old_name)?;
        let new_full = self.namespace.full_name(new_name)?;

        let mut sessions = self.lock();
        if !sessions.contains_key(&old_full) {
            return Err(RegistryError::NotFound(old_full));
        }
        if old_full != new_full && sessions.contains_key(&new_full) {
            return Err(RegistryError::Conflict(new_full));
        }

        let Some(old) = sessions.remove(&old_full) else {
            return Err(RegistryError::NotFound(old_full));
        };
        let renamed = Session::new(
            &self.namespace,
            new_full.clone(),
            old.created_at,
            old.working_directory,
        );
        sessions.insert(new_full, renamed.clone());
        Ok(renamed)
    }
}

/// Snapshot of one fake PTY process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProcess {
    pub pid: u32,
    pub generation: Generation,
    pub session_name: String,
    pub alive: bool,
    pub input: Vec<u8>,
    pub size: (u16, u16),
}

struct ProcessEntry {
    process: MemoryProcess,
    events: PtyEventSender,
    exit_sent: bool,
}

#[derive(Default)]
struct SpawnerState {
    next_pid: u32,
    processes: BTreeMap<u32, ProcessEntry>,
    fail_next_spawn: bool,
}

type SharedState = Arc<Mutex<SpawnerState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, SpawnerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a process dead and queues its exit event, once.
fn finish_process(state: &SharedState, pid: u32, info: ExitInfo) -> Option<(PtyEventSender, PtyEvent)> {
    let mut state = lock_state(state);
    let entry = state.processes.get_mut(&pid)?;
    entry.process.alive = false;
    if entry.exit_sent {
        return None;
    }
    entry.exit_sent = true;
    Some((
        entry.events.clone(),
        PtyEvent::exit(entry.process.generation, info),
    ))
}

/// PTY spawner that records processes instead of starting them.
#[derive(Clone, Default)]
pub struct MemorySpawner {
    state: SharedState,
}

impl MemorySpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `spawn` fail.
    pub fn fail_next_spawn(&self) {
        lock_state(&self.state).fail_next_spawn = true;
    }

    /// Number of processes ever spawned.
    pub fn spawned_count(&self) -> usize {
        lock_state(&self.state).processes.len()
    }

    /// Number of processes still alive.
    pub fn live_count(&self) -> usize {
        lock_state(&self.state)
            .processes
            .values()
            .filter(|e| e.process.alive)
            .count()
    }

    /// All processes in spawn order.
    pub fn processes(&self) -> Vec<MemoryProcess> {
        lock_state(&self.state)
            .processes
            .values()
            .map(|e| e.process.clone())
            .collect()
    }

    /// Snapshot of one process.
    pub fn process(&self, pid: u32) -> Option<MemoryProcess> {
        lock_state(&self.state)
            .processes
            .get(&pid)
            .map(|e| e.process.clone())
    }

    /// Input written to a process so far, as text.
    pub fn input_of(&self, pid: u32) -> String {
        self.process(pid)
            .map(|p| String::from_utf8_lossy(&p.input).into_owned())
            .unwrap_or_default()
    }

    /// Emits output from a process, as its reader would. Returns false when
    /// the process is unknown, dead, or its receiver is gone.
    pub async fn emit_output(&self, pid: u32, text: &str) -> bool {
        let target = {
            let state = lock_state(&self.state);
            state
                .processes
                .get(&pid)
                .filter(|e| e.process.alive)
                .map(|e| (e.events.clone(), e.process.generation))
        };

        match target {
            Some((events, generation)) => events
                .send(PtyEvent::output(generation, text))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Ends a process on its own, as if the session was killed underneath it.
    pub async fn exit(&self, pid: u32, info: ExitInfo) -> bool {
        match finish_process(&self.state, pid, info) {
            Some((events, event)) => events.send(event).await.is_ok(),
            None => false,
        }
    }
}

impl PtySpawner for MemorySpawner {
    type Handle = MemoryPty;

    async fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> Result<MemoryPty, PtyError> {
        let mut state = lock_state(&self.state);

        if std::mem::take(&mut state.fail_next_spawn) {
            return Err(PtyError::SpawnFailed(format!(
                "refusing to attach {}",
                request.session_name
            )));
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(
            pid,
            ProcessEntry {
                process: MemoryProcess {
                    pid,
                    generation: request.generation,
                    session_name: request.session_name.clone(),
                    alive: true,
                    input: Vec::new(),
                    size: (request.cols, request.rows),
                },
                events,
                exit_sent: false,
            },
        );

        Ok(MemoryPty {
            pid,
            generation: request.generation,
            session_name: request.session_name,
            state: Arc::clone(&self.state),
        })
    }
}

/// Handle to a fake PTY process.
pub struct MemoryPty {
    pid: u32,
    generation: Generation,
    session_name: String,
    state: SharedState,
}

impl MemoryPty {
    fn with_process<T>(&self, f: impl FnOnce(&mut MemoryProcess) -> T) -> Option<T> {
        let mut state = lock_state(&self.state);
        state
            .processes
            .get_mut(&self.pid)
            .filter(|e| e.process.alive)
            .map(|e| f(&mut e.process))
    }
}

impl PtyHandle for MemoryPty {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn session_name(&self) -> &str {
        &self.session_name
    }

    fn is_alive(&self) -> bool {
        self.with_process(|_| ()).is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.with_process(|p| p.input.extend_from_slice(data));
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.with_process(|p| p.size = (cols, rows));
        Ok(())
    }

    fn kill(&mut self) {
        let signalled = ExitInfo {
            exit_code: None,
            signal: Some("SIGHUP".to_string()),
        };
        if let Some((events, event)) = finish_process(&self.state, self.pid, signalled) {
            // The connection may already be gone; a dropped exit is fine then.
            let _ = events.try_send(event);
        }
    }
}
