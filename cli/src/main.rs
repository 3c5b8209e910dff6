//! figpad - run design-tool scripts from the terminal
//!
//! Runs one script in the sandboxed plugin runtime with a simulated UI on
//! the other end of the transport. Printed values go to stdout as they
//! arrive, the script's result is printed as JSON when it finishes.
//!
//! ## Module Structure
//! - `fetch` - HTTP requests behind the network helpers
//! - `helpers` - Constants, error formatting and output formatting
//! - `state` - Simulated UI and the in-memory document behind `host`
//! - `types` - Command-line arguments and settings

mod fetch;
mod helpers;
mod state;
mod types;

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tokio::task::LocalSet;
use tokio::time::Instant;

use figpad_engine::{InMemoryTransport, Router, Supervisor};
use figpad_protocol::RequestId;
use figpad_script_host::ScriptHost;

use helpers::{error_runtime, format_failure, read_script, DEFAULT_LOG_FILTER};
use state::{host_api, Document, EvalOutcome, SimulatedUi, UiEvent};
use types::{Args, Settings};

/// How a session ended
#[derive(Debug)]
struct Outcome {
    response: EvalOutcome,
    timed_out: bool,
}

/// Run `source` to completion against a simulated UI
async fn session(settings: Settings, source: String, timeout: Option<Duration>) -> Result<Outcome, String> {
    let (mut ui, mut plugin) = InMemoryTransport::new();
    let supervisor = Supervisor::new(Rc::new(plugin.outbox()));
    let document = Rc::new(RefCell::new(Document::default()));
    let host = ScriptHost::new(
        supervisor.clone(),
        settings.script,
        settings.policy,
        host_api(document),
    );
    let router = Router::with_scripts(supervisor, Rc::new(host));
    tokio::task::spawn_local(async move { router.run(&mut plugin).await });

    let mut sim = SimulatedUi::new(ui.sender());
    let id = RequestId::generate();
    tracing::debug!(request_id = %id, "starting script");
    sim.eval(id.clone(), source)?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    loop {
        let message = match deadline.filter(|_| !timed_out) {
            Some(deadline) => tokio::select! {
                message = ui.recv() => message,
                () = tokio::time::sleep_until(deadline) => {
                    tracing::info!(request_id = %id, "timeout reached, stopping script");
                    timed_out = true;
                    sim.stop(id.clone())?;
                    continue;
                }
            },
            None => ui.recv().await,
        };
        let Some(message) = message else {
            return Err("plugin runtime stopped before the script finished".to_string());
        };
        match sim.handle(message)? {
            UiEvent::Print(line) => println!("{}", line),
            UiEvent::Finished(response) if response.id == id => {
                return Ok(Outcome { response, timed_out });
            }
            UiEvent::Finished(response) => {
                tracing::warn!(request_id = %response.id, "response for an unknown script");
            }
            UiEvent::Handled => {}
        }
    }
}

/// Print the outcome; `Ok(false)` means the script did not succeed
fn report(outcome: &Outcome, timeout: Option<u64>) -> Result<bool, String> {
    if let Some(failure) = &outcome.response.error {
        eprintln!("{}", format_failure(failure));
        return Ok(false);
    }
    if outcome.timed_out {
        eprintln!("Script stopped after {} ms", timeout.unwrap_or_default());
        return Ok(false);
    }
    if let Some(result) = &outcome.response.result {
        let text = serde_json::to_string_pretty(result).map_err(|e| e.to_string())?;
        println!("{}", text);
    }
    Ok(true)
}

fn run(args: &Args) -> Result<bool, String> {
    let settings = Settings::load(args.config.as_deref())?.with_args(args);
    let source = read_script(&args.script)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| error_runtime(&e.to_string()))?;
    let timeout = args.timeout.map(Duration::from_millis);
    let outcome = LocalSet::new().block_on(&runtime, session(settings, source, timeout))?;
    report(&outcome, args.timeout)
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("figpad: {}", error);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run_local(source: &str, timeout: Option<Duration>) -> Outcome {
        LocalSet::new()
            .run_until(session(Settings::default(), source.to_string(), timeout))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn session_returns_the_script_value() {
        let outcome = run_local("print('hi'); return 1 + 2", None).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.response.result, Some(json!(3)));
        assert_eq!(outcome.response.error, None);
        assert!(report(&outcome, None).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn session_reports_failures() {
        let outcome = run_local("throw new RangeError('nope')", None).await;
        let failure = outcome.response.error.clone().unwrap();
        assert_eq!(failure.name, "RangeError");
        assert!(!report(&outcome, None).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_endless_scripts() {
        let outcome = run_local("setInterval(() => {}, 10)", Some(Duration::from_millis(100))).await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.response.error, None);
        assert!(!report(&outcome, Some(100)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_requests_are_answered_by_the_ui() {
        let source = r#"
            const w = createWorker(() => {})
            const reply = await w.request({ a: 1 })
            w.terminate()
            return reply
        "#;
        let outcome = run_local(source, None).await;
        assert_eq!(outcome.response.result, Some(json!({"a": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn network_helpers_need_the_flag() {
        let (url, server) = fetch::tests::serve_once("application/json", r#"{"items":[1,2,3]}"#);
        let source = format!("return (await fetchJson({url:?})).items.length");

        let denied = run_local(&source, None).await;
        assert_eq!(denied.response.error.map(|f| f.name), Some("ScripterError".to_string()));

        let mut settings = Settings::default();
        settings.policy.set_allow_network(true);
        let outcome = LocalSet::new()
            .run_until(session(settings, source, None))
            .await
            .unwrap();
        server.join().unwrap();
        assert_eq!(outcome.response.result, Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn created_nodes_are_found_on_the_page() {
        let source = r#"
            Frame({ name: "f" }, Rectangle())
            return (await find(isRectangle)).length
        "#;
        let outcome = run_local(source, None).await;
        assert_eq!(outcome.response.result, Some(json!(1)));
    }
}
