use color_eyre::Result;
use crucible_engine::{
    progress_channel, ExecutionEvent, JobStatus, PipelineController, TemplateParser,
};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage(&args[0]);
        std::process::exit(2);
    }

    let command = args[1].as_str();
    let template_path = &args[2];

    match command {
        "validate" => {
            let template = TemplateParser::from_file(template_path)?;
            println!("Template OK: {}", template.display_name());
            println!("Axes: {}", template.axes.len());
            println!("Steps: {}", template.steps.len());
            Ok(())
        }
        "run" => run(template_path).await,
        other => {
            eprintln!("Unknown command: {}", other);
            usage(&args[0]);
            std::process::exit(2);
        }
    }
}

fn usage(program: &str) {
    eprintln!("Usage: {} run <template.yaml>", program);
    eprintln!("       {} validate <template.yaml>", program);
}

async fn run(template_path: &str) -> Result<()> {
    let template = TemplateParser::from_file(template_path)?;
    println!("Loading template from: {}", template_path);
    println!("Pipeline: {}", template.display_name());
    println!();

    let workspace = env::current_dir()?;
    let (tx, mut rx) = progress_channel();

    let controller = PipelineController::new()
        .with_workspace(workspace)
        .with_progress(tx);

    let runner = tokio::spawn(async move { controller.run(template).await });

    while let Some(event) = rx.recv().await {
        match event {
            ExecutionEvent::PipelineStarted {
                pipeline_name,
                total_jobs,
            } => {
                println!("==> Pipeline started: {} ({} jobs)\n", pipeline_name, total_jobs);
            }
            ExecutionEvent::ProvisioningStarted { job_name } => {
                println!("[{}] Provisioning environment...", job_name);
            }
            ExecutionEvent::ProvisioningCompleted {
                job_name,
                cache_hit,
                duration,
            } => {
                println!(
                    "[{}] Environment ready ({}, {}ms)",
                    job_name,
                    if cache_hit { "cache hit" } else { "built" },
                    duration.as_millis()
                );
            }
            ExecutionEvent::JobStarted {
                job_name,
                total_steps,
            } => {
                println!("[{}] Running {} steps", job_name, total_steps);
            }
            ExecutionEvent::StepCompleted {
                job_name,
                step_name,
                step_index,
                exit_code,
                tolerated,
                duration,
            } => {
                println!(
                    "[{}] Step {}: {} ({}ms, exit code: {:?}){}",
                    job_name,
                    step_index + 1,
                    step_name,
                    duration.as_millis(),
                    exit_code,
                    if tolerated { " [tolerated]" } else { "" }
                );
            }
            ExecutionEvent::JobCompleted {
                job_name,
                status,
                duration,
            } => {
                println!(
                    "[{}] {:?} ({}ms)\n",
                    job_name,
                    status,
                    duration.as_millis()
                );
            }
            ExecutionEvent::JobCanceled { job_name, reason } => {
                println!("[{}] Canceled: {}\n", job_name, reason);
            }
            ExecutionEvent::UploadCompleted { success } => {
                println!(
                    "Coverage upload: {}",
                    if success { "ok" } else { "failed" }
                );
            }
            ExecutionEvent::PipelineCompleted {
                success, duration, ..
            } => {
                println!("==> Pipeline completed in {}ms", duration.as_millis());
                println!("Status: {}", if success { "SUCCESS" } else { "FAILED" });
            }
            _ => {}
        }
    }

    let result = runner.await??;

    let degraded = result
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::SucceededWithIssues)
        .count();
    println!();
    println!(
        "Jobs: {} succeeded, {} degraded, {} failed",
        result.succeeded_count(),
        degraded,
        result.failed_count()
    );
    if let Some(error) = &result.upload_error {
        println!("Upload error: {}", error);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
