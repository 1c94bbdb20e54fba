use hookflow::{config, db};
use hookflow::jobs::{JobStatus, JobStore, JobsRepo, NewJob};
use serde_json::Value;
use std::env;
use std::time::Duration;
use uuid::Uuid;

const USAGE: &str = "hookflowctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - enqueue <name> <priority> <json>\n\
     - show <job_id>\n\
     - list [status]\n\
     - counts\n\
     - sweep [visibility_secs]\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL; enqueue honours MAX_ATTEMPTS.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("HOOKFLOW_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;
    let repo = JobsRepo::new(pool.clone());

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        "reset" => {
            sqlx::query("TRUNCATE TABLE jobs RESTART IDENTITY")
                .execute(&pool)
                .await?;
            println!("reset OK");
        }
        "enqueue" => {
            let (Some(name), Some(priority), Some(raw)) = (args.get(2), args.get(3), args.get(4))
            else {
                anyhow::bail!("usage: hookflowctl enqueue <name> <priority> <json>");
            };
            let priority: i32 = priority.parse()?;
            let payload: Value = serde_json::from_str(raw)?;
            let max_attempts = config::max_attempts(|key| env::var(key).ok());

            let id = repo
                .enqueue(NewJob::now(name.as_str(), payload, priority, max_attempts))
                .await?;
            println!("+ enqueued {name} priority={priority} id={id}");
        }
        "show" => {
            let id: Uuid = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: hookflowctl show <job_id>"))?
                .parse()?;
            let Some(job) = repo.get(id).await? else {
                anyhow::bail!("job {id} not found");
            };

            println!(
                "{} name={} status={} priority={} attempts={}/{} progress={}%",
                job.id,
                job.name,
                job.status,
                job.priority,
                job.attempts,
                job.max_attempts,
                job.progress
            );
            for entry in &job.log {
                println!("  {}  {}", entry.at.to_rfc3339(), entry.message);
            }
            if let Some(result) = &job.result {
                println!("result: {}", serde_json::to_string_pretty(result)?);
            }
            if let Some(err) = &job.error {
                println!("error: {err}");
            }
            if let Some(err) = &job.last_error {
                println!("last_error: {err}");
            }
        }
        "list" => {
            let status = args
                .get(2)
                .map(|s| s.parse::<JobStatus>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            for job in repo.list(status, 50).await? {
                println!(
                    "{} {:<10} {:<14} pri={:<4} attempts={}/{} created={}",
                    job.id,
                    job.status,
                    job.name,
                    job.priority,
                    job.attempts,
                    job.max_attempts,
                    job.created_at.to_rfc3339()
                );
            }
        }
        "counts" => {
            let c = repo.counts().await?;
            println!(
                "jobs: waiting={} active={} completed={} failed={}",
                c.waiting, c.active, c.completed, c.failed
            );
        }
        "sweep" => {
            let secs: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(150);
            let reclaimed = repo.reclaim_stalled(Duration::from_secs(secs)).await?;
            println!(
                "sweep: requeued={} failed={}",
                reclaimed.requeued.len(),
                reclaimed.exhausted.len()
            );
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
