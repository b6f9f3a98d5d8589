use crate::config::PoolConfig;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Opaque factory for storage-backend connections. The pool never looks
/// inside a connection; it only bounds how many are open at once.
pub trait BackendConnector: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn connect(&self) -> impl Future<Output = AppResult<Self::Conn>> + Send;
}

/// Per-agent connection accounting.
#[derive(Debug, Clone)]
struct AgentConnectionInfo {
    agent_type: String,
    connection_count: usize,
    max_connections: usize,
    priority: u8,
    last_activity: Instant,
}

/// Default connection budget and priority per agent type. Unknown types get
/// a small allowance at the lowest priority.
fn agent_type_defaults(agent_type: &str) -> (usize, u8) {
    match agent_type {
        "crawler" => (8, 2),
        "scraper" => (10, 3),
        "downloader" => (5, 2),
        "database" => (3, 4),
        "nlp" => (4, 1),
        "monitoring" => (2, 1),
        "testing" => (2, 1),
        "orchestrator" => (3, 4),
        _ => (3, 1),
    }
}

#[derive(Debug)]
struct PoolState {
    agents: HashMap<String, AgentConnectionInfo>,
    // Live slot ids per agent; ids are monotonic, so the smallest id in a
    // set is that agent's oldest connection.
    live: HashMap<String, BTreeSet<u64>>,
    total_active: usize,
    next_slot_id: u64,
    shutdown: bool,
}

impl PoolState {
    fn new() -> Self {
        Self {
            agents: HashMap::new(),
            live: HashMap::new(),
            total_active: 0,
            next_slot_id: 0,
            shutdown: false,
        }
    }

    /// Free one accounting slot. Returns false if the slot was already
    /// revoked by preemption or an idle sweep, in which case counters were
    /// adjusted at revocation time and must not move again.
    fn release_slot(&mut self, agent_id: &str, slot_id: u64) -> bool {
        let removed = self
            .live
            .get_mut(agent_id)
            .map(|slots| slots.remove(&slot_id))
            .unwrap_or(false);

        if removed {
            if let Some(agent) = self.agents.get_mut(agent_id) {
                agent.connection_count = agent.connection_count.saturating_sub(1);
                agent.last_activity = Instant::now();
            }
            self.total_active = self.total_active.saturating_sub(1);
        }
        removed
    }

    /// Drop an agent's registration and all of its accounting.
    fn remove_agent(&mut self, agent_id: &str) {
        if let Some(slots) = self.live.remove(agent_id) {
            self.total_active = self.total_active.saturating_sub(slots.len());
        }
        self.agents.remove(agent_id);
    }
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scoped connection handle. Exactly one (agent, request) pair owns it;
/// dropping it frees the accounting slot and closes the backend connection.
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
    agent_id: String,
    slot_id: u64,
    state: Arc<Mutex<PoolState>>,
}

impl<C> PooledConnection<C> {
    pub fn conn(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// True once preemption or an idle sweep has taken this slot back. The
    /// underlying handle still works until dropped, but the holder should
    /// stop issuing new work on it.
    pub fn is_revoked(&self) -> bool {
        let state = lock_state(&self.state);
        !state
            .live
            .get(&self.agent_id)
            .map(|slots| slots.contains(&self.slot_id))
            .unwrap_or(false)
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        if state.release_slot(&self.agent_id, self.slot_id) {
            debug!(agent_id = %self.agent_id, slot = self.slot_id, "Released pooled connection");
        }
        // The backend connection itself closes when `self.conn` drops.
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_type: String,
    pub connections: usize,
    pub max_connections: usize,
    pub priority: u8,
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_connections: usize,
    pub max_connections: usize,
    pub registered_agents: usize,
    pub agents: Vec<AgentStatus>,
}

/// Connection pool manager for multi-agent access to the storage backend.
///
/// Bounds total concurrent connections globally and per agent, preempts
/// lower-priority agents under contention, and unregisters agents that go
/// idle past a timeout. All bookkeeping happens under one mutex that is
/// held only across in-memory state, never across backend I/O.
pub struct AgentPoolManager<B: BackendConnector> {
    backend: B,
    state: Arc<Mutex<PoolState>>,
    total_max_connections: usize,
    sweep_interval: Duration,
    idle_timeout: Duration,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: BackendConnector> AgentPoolManager<B> {
    pub fn new(backend: B, config: &PoolConfig) -> Self {
        debug!(
            total_max = config.total_max_connections,
            "Initializing agent pool manager"
        );
        Self {
            backend,
            state: Arc::new(Mutex::new(PoolState::new())),
            total_max_connections: config.total_max_connections,
            sweep_interval: config.sweep_interval,
            idle_timeout: config.idle_timeout,
            sweep_handle: Mutex::new(None),
        }
    }

    /// Start the background idle-reclamation task. Safe to call once after
    /// construction; a second call replaces the previous task.
    pub fn start(&self) {
        let state = self.state.clone();
        let idle_timeout = self.idle_timeout;
        let sweep_interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                Self::sweep_idle(&state, idle_timeout);
            }
        });

        let mut slot = self.sweep_handle.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Register an agent. Returns false (and warns) when the id is taken.
    /// Unspecified limits come from the per-type default table.
    pub fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        max_connections: Option<usize>,
        priority: Option<u8>,
    ) -> bool {
        let mut state = lock_state(&self.state);
        if state.shutdown {
            warn!(agent_id, "Cannot register agent: pool is shut down");
            return false;
        }
        if state.agents.contains_key(agent_id) {
            warn!(agent_id, "Agent already registered");
            return false;
        }

        let (default_max, default_priority) = agent_type_defaults(agent_type);
        let info = AgentConnectionInfo {
            agent_type: agent_type.to_string(),
            connection_count: 0,
            max_connections: max_connections.unwrap_or(default_max),
            priority: priority.unwrap_or(default_priority),
            last_activity: Instant::now(),
        };

        info!(
            agent_id,
            agent_type,
            max_connections = info.max_connections,
            priority = info.priority,
            "Registered agent"
        );
        state.agents.insert(agent_id.to_string(), info);
        state.live.insert(agent_id.to_string(), BTreeSet::new());
        true
    }

    /// Remove an agent's registration and free all of its slots.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut state = lock_state(&self.state);
        let known = state.agents.contains_key(agent_id);
        if known {
            state.remove_agent(agent_id);
            info!(agent_id, "Unregistered agent");
        }
        known
    }

    /// Acquire a scoped backend connection for `agent_id`.
    ///
    /// Slot reservation happens under the pool lock; the backend connect
    /// runs outside it and the reservation is rolled back if it fails.
    pub async fn acquire(&self, agent_id: &str) -> AppResult<PooledConnection<B::Conn>> {
        let slot_id = {
            let mut state = lock_state(&self.state);
            if state.shutdown {
                return Err(AppError::Internal("connection pool is shut down".to_string()));
            }

            let agent = state
                .agents
                .get(agent_id)
                .ok_or_else(|| AppError::NotRegistered(agent_id.to_string()))?;

            if agent.connection_count >= agent.max_connections {
                return Err(AppError::Capacity(format!(
                    "agent {agent_id} is at its limit of {} connections",
                    agent.max_connections
                )));
            }

            if state.total_active >= self.total_max_connections
                && !Self::preempt_for(&mut state, agent_id)
            {
                return Err(AppError::Capacity(format!(
                    "pool is at its limit of {} connections and no lower-priority \
                     connection can be reclaimed",
                    self.total_max_connections
                )));
            }

            // Reserve the slot before connecting so the cap holds while the
            // backend I/O is in flight.
            let slot_id = state.next_slot_id;
            state.next_slot_id += 1;
            if let Some(slots) = state.live.get_mut(agent_id) {
                slots.insert(slot_id);
            }
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.connection_count += 1;
                agent.last_activity = Instant::now();
            }
            state.total_active += 1;
            slot_id
        };

        match self.backend.connect().await {
            Ok(conn) => {
                debug!(agent_id, slot = slot_id, "Opened pooled connection");
                Ok(PooledConnection {
                    conn,
                    agent_id: agent_id.to_string(),
                    slot_id,
                    state: self.state.clone(),
                })
            }
            Err(e) => {
                let mut state = lock_state(&self.state);
                state.release_slot(agent_id, slot_id);
                Err(e)
            }
        }
    }

    /// Revoke one slot from the best preemption candidate: any *other*
    /// agent with strictly lower priority holding more than one connection,
    /// lowest priority first, then longest idle. An agent is never taken
    /// down to zero connections this way.
    fn preempt_for(state: &mut PoolState, requesting_agent_id: &str) -> bool {
        let requester_priority = match state.agents.get(requesting_agent_id) {
            Some(agent) => agent.priority,
            None => return false,
        };

        let victim = state
            .agents
            .iter()
            .filter(|(id, info)| {
                id.as_str() != requesting_agent_id
                    && info.priority < requester_priority
                    && info.connection_count > 1
            })
            .min_by_key(|(_, info)| (info.priority, info.last_activity))
            .map(|(id, _)| id.clone());

        let Some(victim_id) = victim else {
            return false;
        };

        // Oldest slot first: smallest id in the victim's live set.
        let oldest_slot = state
            .live
            .get(&victim_id)
            .and_then(|slots| slots.iter().next().copied());

        match oldest_slot {
            Some(slot_id) => {
                state.release_slot(&victim_id, slot_id);
                info!(
                    victim = %victim_id,
                    requester = requesting_agent_id,
                    "Preempted connection slot"
                );
                true
            }
            None => false,
        }
    }

    /// Unregister every agent idle longer than the timeout. Called by the
    /// background task; exposed for deterministic use in tests and tools.
    pub fn sweep_now(&self) -> usize {
        Self::sweep_idle(&self.state, self.idle_timeout)
    }

    fn sweep_idle(state: &Mutex<PoolState>, idle_timeout: Duration) -> usize {
        let mut state = lock_state(state);
        let idle: Vec<String> = state
            .agents
            .iter()
            .filter(|(_, info)| info.last_activity.elapsed() > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for agent_id in &idle {
            info!(agent_id, "Reclaiming idle agent's connections");
            state.remove_agent(agent_id);
        }
        idle.len()
    }

    /// Non-mutating snapshot of pool counters, safe while acquisitions are
    /// in flight.
    pub fn get_pool_status(&self) -> PoolStatus {
        let state = lock_state(&self.state);
        let mut agents: Vec<AgentStatus> = state
            .agents
            .iter()
            .map(|(id, info)| AgentStatus {
                agent_id: id.clone(),
                agent_type: info.agent_type.clone(),
                connections: info.connection_count,
                max_connections: info.max_connections,
                priority: info.priority,
                idle_seconds: info.last_activity.elapsed().as_secs(),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        PoolStatus {
            total_connections: state.total_active,
            max_connections: self.total_max_connections,
            registered_agents: state.agents.len(),
            agents,
        }
    }

    /// Stop the sweep task and clear all state. Idempotent; outstanding
    /// guards drop harmlessly afterwards.
    pub fn shutdown(&self) {
        info!("Shutting down agent pool manager");
        let handle = {
            let mut slot = self.sweep_handle.lock().unwrap_or_else(|p| p.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut state = lock_state(&self.state);
        state.shutdown = true;
        state.agents.clear();
        state.live.clear();
        state.total_active = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend that counts physically open connections.
    struct FakeBackend {
        open: Arc<AtomicUsize>,
        fail_next: AtomicBool,
    }

    #[derive(Debug)]
    struct FakeConn {
        open: Arc<AtomicUsize>,
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                open: Arc::new(AtomicUsize::new(0)),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    impl BackendConnector for FakeBackend {
        type Conn = FakeConn;

        async fn connect(&self) -> AppResult<FakeConn> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AppError::Database("backend unavailable".to_string()));
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                open: self.open.clone(),
            })
        }
    }

    fn pool(total_max: usize) -> AgentPoolManager<FakeBackend> {
        AgentPoolManager::new(
            FakeBackend::new(),
            &PoolConfig {
                total_max_connections: total_max,
                sweep_interval: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(1800),
            },
        )
    }

    fn assert_counters_consistent(pool: &AgentPoolManager<FakeBackend>) {
        let status = pool.get_pool_status();
        let per_agent: usize = status.agents.iter().map(|a| a.connections).sum();
        assert_eq!(per_agent, status.total_connections);
        assert!(status.total_connections <= status.max_connections);
        for agent in &status.agents {
            assert!(agent.connections <= agent.max_connections);
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let pool = pool(10);
        assert!(pool.register("a1", "crawler", None, None));
        assert!(!pool.register("a1", "crawler", None, None));
    }

    #[tokio::test]
    async fn unknown_agent_cannot_acquire() {
        let pool = pool(10);
        let err = pool.acquire("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn type_defaults_fill_unspecified_limits() {
        let pool = pool(50);
        pool.register("s1", "scraper", None, None);
        pool.register("x1", "unheard-of", None, None);
        let status = pool.get_pool_status();
        let s1 = status.agents.iter().find(|a| a.agent_id == "s1").unwrap();
        assert_eq!((s1.max_connections, s1.priority), (10, 3));
        let x1 = status.agents.iter().find(|a| a.agent_id == "x1").unwrap();
        assert_eq!((x1.max_connections, x1.priority), (3, 1));
    }

    #[tokio::test]
    async fn counters_stay_consistent_across_acquire_release() {
        let pool = pool(10);
        pool.register("a1", "crawler", None, None);
        pool.register("a2", "downloader", None, None);

        let c1 = pool.acquire("a1").await.unwrap();
        assert_counters_consistent(&pool);
        let c2 = pool.acquire("a1").await.unwrap();
        let c3 = pool.acquire("a2").await.unwrap();
        assert_counters_consistent(&pool);
        assert_eq!(pool.get_pool_status().total_connections, 3);

        drop(c2);
        assert_counters_consistent(&pool);
        assert_eq!(pool.get_pool_status().total_connections, 2);
        drop(c1);
        drop(c3);
        assert_eq!(pool.get_pool_status().total_connections, 0);
        assert_counters_consistent(&pool);
    }

    #[tokio::test]
    async fn agent_cap_is_enforced() {
        let pool = pool(10);
        pool.register("t1", "testing", None, None); // max 2
        let _c1 = pool.acquire("t1").await.unwrap();
        let _c2 = pool.acquire("t1").await.unwrap();
        let err = pool.acquire("t1").await.unwrap_err();
        assert!(matches!(err, AppError::Capacity(_)));
        assert_counters_consistent(&pool);
    }

    #[tokio::test]
    async fn higher_priority_agent_preempts_oldest_slot() {
        let pool = pool(8);
        pool.register("a1", "crawler", Some(8), Some(2));
        pool.register("a2", "database", Some(3), Some(4));

        let mut a1_conns = Vec::new();
        for _ in 0..8 {
            a1_conns.push(pool.acquire("a1").await.unwrap());
        }
        assert_eq!(pool.get_pool_status().total_connections, 8);

        let a2_conn = pool.acquire("a2").await.unwrap();
        let status = pool.get_pool_status();
        assert_eq!(status.total_connections, 8);
        let a1 = status.agents.iter().find(|a| a.agent_id == "a1").unwrap();
        assert_eq!(a1.connections, 7);

        // The oldest a1 slot was the one revoked.
        assert!(a1_conns[0].is_revoked());
        assert!(!a1_conns[1].is_revoked());
        assert!(!a2_conn.is_revoked());
        assert_counters_consistent(&pool);
    }

    #[tokio::test]
    async fn revoked_guard_drop_does_not_double_decrement() {
        let pool = pool(2);
        pool.register("low", "nlp", Some(2), Some(1));
        pool.register("high", "database", Some(2), Some(4));

        let mut low_conns = vec![
            pool.acquire("low").await.unwrap(),
            pool.acquire("low").await.unwrap(),
        ];
        let _high_conn = pool.acquire("high").await.unwrap();
        assert_eq!(pool.get_pool_status().total_connections, 2);

        // Dropping the revoked guard must not move the counters.
        let revoked = low_conns.remove(0);
        assert!(revoked.is_revoked());
        drop(revoked);
        assert_eq!(pool.get_pool_status().total_connections, 2);

        // Dropping the live guard still releases normally.
        drop(low_conns.pop());
        assert_eq!(pool.get_pool_status().total_connections, 1);
        assert_counters_consistent(&pool);
    }

    #[tokio::test]
    async fn agent_with_single_connection_is_never_preempted() {
        let pool = pool(1);
        pool.register("low", "nlp", Some(1), Some(1));
        pool.register("high", "database", Some(1), Some(4));

        let _low_conn = pool.acquire("low").await.unwrap();
        let err = pool.acquire("high").await.unwrap_err();
        assert!(matches!(err, AppError::Capacity(_)));
        assert_eq!(pool.get_pool_status().total_connections, 1);
    }

    #[tokio::test]
    async fn equal_priority_never_preempts() {
        let pool = pool(2);
        pool.register("a", "crawler", Some(2), Some(2));
        pool.register("b", "downloader", Some(2), Some(2));

        let _c1 = pool.acquire("a").await.unwrap();
        let _c2 = pool.acquire("a").await.unwrap();
        let err = pool.acquire("b").await.unwrap_err();
        assert!(matches!(err, AppError::Capacity(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn preemption_prefers_lowest_priority_then_longest_idle() {
        let pool = pool(4);
        pool.register("old", "nlp", Some(2), Some(1));
        pool.register("recent", "nlp", Some(2), Some(1));
        pool.register("high", "database", Some(1), Some(4));

        let old_conns = vec![
            pool.acquire("old").await.unwrap(),
            pool.acquire("old").await.unwrap(),
        ];
        tokio::time::advance(Duration::from_secs(60)).await;
        let _recent_conns = vec![
            pool.acquire("recent").await.unwrap(),
            pool.acquire("recent").await.unwrap(),
        ];

        let _high_conn = pool.acquire("high").await.unwrap();
        let status = pool.get_pool_status();
        let old = status.agents.iter().find(|a| a.agent_id == "old").unwrap();
        let recent = status.agents.iter().find(|a| a.agent_id == "recent").unwrap();
        assert_eq!(old.connections, 1);
        assert_eq!(recent.connections, 2);
        assert!(old_conns[0].is_revoked());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_removes_agent_only_after_timeout() {
        let pool = AgentPoolManager::new(
            FakeBackend::new(),
            &PoolConfig {
                total_max_connections: 10,
                sweep_interval: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(30),
            },
        );
        pool.register("a1", "crawler", None, None);
        let _conn = pool.acquire("a1").await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(pool.sweep_now(), 0);
        assert_eq!(pool.get_pool_status().registered_agents, 1);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(pool.sweep_now(), 1);
        let status = pool.get_pool_status();
        assert_eq!(status.registered_agents, 0);
        assert_eq!(status.total_connections, 0);
    }

    #[tokio::test]
    async fn failed_connect_rolls_back_reservation() {
        let backend = FakeBackend::new();
        backend.fail_next.store(true, Ordering::SeqCst);
        let pool = AgentPoolManager::new(
            backend,
            &PoolConfig {
                total_max_connections: 10,
                sweep_interval: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(1800),
            },
        );
        pool.register("a1", "crawler", None, None);

        let err = pool.acquire("a1").await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
        let status = pool.get_pool_status();
        assert_eq!(status.total_connections, 0);
        let a1 = status.agents.iter().find(|a| a.agent_id == "a1").unwrap();
        assert_eq!(a1.connections, 0);

        // Next acquire works again.
        let _conn = pool.acquire("a1").await.unwrap();
        assert_eq!(pool.get_pool_status().total_connections, 1);
    }

    #[tokio::test]
    async fn physical_connections_close_when_guards_drop() {
        let pool = pool(10);
        let open = pool.backend.open.clone();
        pool.register("a1", "crawler", None, None);

        let c1 = pool.acquire("a1").await.unwrap();
        let c2 = pool.acquire("a1").await.unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 2);
        drop(c1);
        drop(c2);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_further_use() {
        let pool = pool(10);
        pool.register("a1", "crawler", None, None);
        let _conn = pool.acquire("a1").await.unwrap();

        pool.shutdown();
        pool.shutdown();

        let status = pool.get_pool_status();
        assert_eq!(status.registered_agents, 0);
        assert_eq!(status.total_connections, 0);
        assert!(!pool.register("a2", "crawler", None, None));
        assert!(pool.acquire("a1").await.is_err());
    }

    #[tokio::test]
    async fn unregister_frees_all_accounting() {
        let pool = pool(10);
        pool.register("a1", "crawler", None, None);
        let _c1 = pool.acquire("a1").await.unwrap();
        let _c2 = pool.acquire("a1").await.unwrap();

        assert!(pool.unregister("a1"));
        assert!(!pool.unregister("a1"));
        let status = pool.get_pool_status();
        assert_eq!(status.registered_agents, 0);
        assert_eq!(status.total_connections, 0);
    }
}
