//! `margin`: open a session and print the task list served through the cache.

use margin_core::{ListQuery, Task};
use margin_sync::{init_tracing, ClientConfig, ClientResult, Session};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("margin: {e}");
        std::process::exit(1);
    }
}

async fn run() -> ClientResult<()> {
    let config = ClientConfig::load()?;
    init_tracing()?;

    let session = Session::open(&config).await?;
    session.load_tasks(ListQuery::all()).await?;

    let tasks = session.tasks.items();
    println!("{} of {} tasks", tasks.len(), session.tasks.total());
    for task in &tasks {
        print_task(task);
    }
    let drafts = session.task_drafts.drafts();
    if !drafts.is_empty() {
        println!("{} local drafts", drafts.len());
        for draft in &drafts {
            println!("  {}  {}", draft.id, draft.derived_title());
        }
    }

    let stats = session.cache().stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        stale_serves = stats.stale_serves,
        "cache stats"
    );
    session.close().await;
    Ok(())
}

fn print_task(task: &Task) {
    let status = serde_json::to_value(task.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    println!("  [{status:<8}] {}  {}", task.id, task.title);
}
