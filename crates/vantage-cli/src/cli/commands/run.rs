use super::exit_codes;
use crate::cli::args::StartArgs;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use vantage_core::model::{ActiveRunProgress, LogKind, StartRunRequest};
use vantage_core::orchestrator::Orchestrator;
use vantage_core::resume::PollOutcome;

pub async fn cmd_start(orch: &Orchestrator, args: StartArgs) -> anyhow::Result<i32> {
    let req = StartRunRequest {
        project_id: args.project,
        question_set_id: args.question_set,
        providers: args.providers,
        name: args.name,
    };

    let printer = LogPrinter::spawn(orch);
    let res = orch
        .start_run(&req, &vantage_core::stream::consumer::NoCallbacks)
        .await;
    printer.finish(orch);

    match res {
        Ok(run_id) => {
            if let Some(p) = orch.pagination() {
                println!(
                    "run {} completed: {} results ({} per page, more: {})",
                    run_id, p.total, p.per_page, p.has_more
                );
            } else {
                println!("run {} completed", run_id);
            }
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("run failed: {}", e);
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

pub async fn cmd_resume(orch: &Orchestrator) -> anyhow::Result<i32> {
    let printer = LogPrinter::spawn(orch);
    let Some(handle) = orch.resume_on_start() else {
        printer.finish(orch);
        println!("no run in flight");
        return Ok(exit_codes::OK);
    };

    let run_id = handle.run_id().to_string();
    let outcome = handle.join().await;
    printer.finish(orch);

    match outcome {
        Ok(PollOutcome::Completed { results_loaded, .. }) => {
            println!("run {} completed (results loaded: {})", run_id, results_loaded);
            Ok(exit_codes::OK)
        }
        Ok(PollOutcome::Failed { error, .. }) => {
            eprintln!("run {} failed: {}", run_id, error);
            Ok(exit_codes::RUN_FAILED)
        }
        Err(e) => {
            eprintln!("lost run {}: {}", run_id, e);
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

/// Echoes progress log lines to stdout as they are appended.
#[derive(Default)]
struct PrintedLines {
    printed: usize,
}

impl PrintedLines {
    fn print_new(&mut self, snap: &ActiveRunProgress) {
        // A shorter log means a fresh run replaced the previous one.
        if snap.log.len() < self.printed {
            self.printed = 0;
        }
        for entry in &snap.log[self.printed..] {
            let prefix = match entry.kind {
                LogKind::Info => "",
                LogKind::Success => "ok: ",
                LogKind::Error => "error: ",
            };
            println!("[{}] {}{}", entry.time.format("%H:%M:%S"), prefix, entry.message);
        }
        self.printed = snap.log.len();
    }
}

struct LogPrinter {
    lines: Arc<Mutex<PrintedLines>>,
    task: JoinHandle<()>,
}

impl LogPrinter {
    fn spawn(orch: &Orchestrator) -> Self {
        let lines = Arc::new(Mutex::new(PrintedLines::default()));
        let mut rx = orch.subscribe_progress();
        let sink = lines.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snap = rx.borrow_and_update().clone();
                if let Some(snap) = snap {
                    sink.lock().unwrap().print_new(&snap);
                }
            }
        });
        Self { lines, task }
    }

    /// Stops following and prints whatever the last snapshot added.
    fn finish(self, orch: &Orchestrator) {
        self.task.abort();
        if let Some(snap) = orch.progress() {
            self.lines.lock().unwrap().print_new(&snap);
        }
    }
}
