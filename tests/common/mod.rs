#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use labour_queue::config::Config;
use labour_queue::database::Database;
use labour_queue::job_scheduling::{
    ExecutionContext, JobExecutor, JobQueue, JobScheduler, Outcome, ProcessExit, ProcessSpawner,
    Worker, WorkerProcess, WorkerRegistry,
};
use labour_queue::models::Labour;
use labour_queue::repositories::{FlagRepository, LabourRepository};

pub struct NoopWorker;

#[async_trait]
impl Worker for NoopWorker {
    async fn execute(&self, _ctx: &ExecutionContext) -> Outcome {
        Outcome::Finished
    }
}

/// Recurring worker whose planning can be switched off
pub struct GatedWorker {
    pub allowed: AtomicBool,
}

#[async_trait]
impl Worker for GatedWorker {
    async fn execute(&self, _ctx: &ExecutionContext) -> Outcome {
        Outcome::Finished
    }

    fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub config: Config,
    pub database: Database,
    pub labours: LabourRepository,
    pub queue: Arc<JobQueue>,
    pub executor: Arc<JobExecutor>,
    pub scheduler: Arc<JobScheduler>,
}

/// In-memory queue with a `NoopWorker` registered under each of `codes`
pub async fn harness(toml: &str, codes: &[&str]) -> Harness {
    harness_with(toml, |registry| {
        for code in codes {
            registry.register(code, NoopWorker).unwrap();
        }
    })
    .await
}

pub async fn harness_with(toml: &str, register: impl FnOnce(&mut WorkerRegistry)) -> Harness {
    let config = Config::from_toml(toml).unwrap();
    let mut registry = WorkerRegistry::new(&config);
    register(&mut registry);
    let registry = Arc::new(registry);

    let database = Database::in_memory().await.unwrap();
    let labours = LabourRepository::new(database.pool());
    let queue = Arc::new(JobQueue::new(
        labours.clone(),
        Arc::clone(&registry),
        &config.server,
    ));
    let executor = Arc::new(JobExecutor::new(labours.clone(), registry));
    let scheduler = Arc::new(JobScheduler::new(
        Arc::clone(&queue),
        labours.clone(),
        FlagRepository::new(database.pool()),
        config.server.plan_ahead_minutes,
        config.server.resolution_minutes,
    ));

    Harness {
        config,
        database,
        labours,
        queue,
        executor,
        scheduler,
    }
}

type ExitSlot = Arc<Mutex<Option<ProcessExit>>>;

/// Spawner handing out in-memory processes the test controls
pub struct FakeSpawner {
    next_pid: AtomicU32,
    pub fail: AtomicBool,
    pub alive: Mutex<HashSet<u32>>,
    /// (labour id, pid, exit) per spawned process, oldest first
    processes: Mutex<Vec<(i64, u32, ExitSlot)>>,
    killed: Arc<Mutex<Vec<i64>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            fail: AtomicBool::new(false),
            alive: Mutex::new(HashSet::new()),
            processes: Mutex::new(Vec::new()),
            killed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Make the latest process spawned for `labour_id` exit with `code`
    pub fn exit(&self, labour_id: i64, code: Option<i32>) {
        let processes = self.processes.lock().unwrap();
        let (_, _, slot) = processes
            .iter()
            .rev()
            .find(|(id, _, _)| *id == labour_id)
            .expect("no process for labour");
        *slot.lock().unwrap() = Some(ProcessExit { code });
    }

    pub fn exit_pid(&self, pid: u32, code: Option<i32>) {
        let processes = self.processes.lock().unwrap();
        let (_, _, slot) = processes
            .iter()
            .find(|(_, p, _)| *p == pid)
            .expect("no process with pid");
        *slot.lock().unwrap() = Some(ProcessExit { code });
    }

    /// Labour ids that got at least one process
    pub fn spawned(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Pids of every process spawned for `labour_id`, oldest first
    pub fn pids(&self, labour_id: i64) -> Vec<u32> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == labour_id)
            .map(|(_, pid, _)| *pid)
            .collect()
    }

    pub fn killed(&self) -> Vec<i64> {
        self.killed.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, labour: &Labour) -> std::io::Result<Box<dyn WorkerProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "worker binary missing",
            ));
        }
        let slot: ExitSlot = Arc::new(Mutex::new(None));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes
            .lock()
            .unwrap()
            .push((labour.id, pid, Arc::clone(&slot)));
        Ok(Box::new(FakeProcess {
            labour_id: labour.id,
            pid,
            exit: slot,
            killed: Arc::clone(&self.killed),
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

struct FakeProcess {
    labour_id: i64,
    pid: u32,
    exit: ExitSlot,
    killed: Arc<Mutex<Vec<i64>>>,
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&mut self) -> std::io::Result<Option<ProcessExit>> {
        Ok(*self.exit.lock().unwrap())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.killed.lock().unwrap().push(self.labour_id);
        *self.exit.lock().unwrap() = Some(ProcessExit { code: None });
        Ok(())
    }
}
