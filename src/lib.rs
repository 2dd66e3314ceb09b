pub mod api;
pub mod audio;
pub mod cli;
pub mod coordinator;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use api::{HttpAuthProvider, HttpBackend, ResponseMeta, Services, TaskContent};
use audio::AudioCapturePipeline;
use cli::Args;
use coordinator::{NextStep, TestError, TestResult, TestSessionCoordinator};
use settings::{default_settings_path, load_settings, save_settings, ClientSettings};
use streaming::ConnectionManager;

/// Fallbacks when a task does not say how long each phase lasts
const DEFAULT_PREP_SECS: u32 = 15;
const DEFAULT_RESPONSE_SECS: u32 = 45;

pub fn run() {
    let args = Args::parse();
    cli::init_logging(&args);

    // tokio-tungstenite and reqwest both pull rustls; pick the provider once
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = resolve_settings(&args);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(take_test(&args, &settings)) {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize result: {}", e),
        },
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn resolve_settings(args: &Args) -> ClientSettings {
    let path = match &args.settings {
        Some(path) => Some(path.clone()),
        None => match default_settings_path() {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Settings: {}, using defaults", e);
                None
            }
        },
    };

    let mut settings = match &path {
        Some(path) => {
            log::info!("Settings: loading {:?}", path);
            load_settings(path)
        }
        None => ClientSettings::default(),
    };
    settings.apply_env_overrides();

    if args.save_settings {
        match &path {
            Some(path) => match save_settings(path, &settings) {
                Ok(()) => log::info!("Settings: saved to {:?}", path),
                Err(e) => log::error!("Settings: {}", e),
            },
            None => log::warn!("Settings: no settings path, nothing saved"),
        }
    }
    settings
}

/// Drive one attempt from session creation to the final score
async fn take_test(args: &Args, settings: &ClientSettings) -> Result<TestResult, TestError> {
    let http_error = |e: api::ApiError| TestError::SessionCreateFailed(e.to_string());

    let mut auth = HttpAuthProvider::new(&settings.api_base_url, settings.http_timeout())
        .map_err(http_error)?;
    let mut signed_in_here = false;
    match (&args.token, &args.email, &args.password) {
        (Some(token), _, _) => auth = auth.with_token(token.clone()),
        (None, Some(email), Some(password)) => {
            auth.login(email, password).await.map_err(|e| {
                log::error!("Auth: sign-in failed: {}", e);
                TestError::AuthRequired
            })?;
            signed_in_here = true;
        }
        _ => {}
    }

    let mut backend =
        HttpBackend::new(&settings.api_base_url, settings.http_timeout()).map_err(http_error)?;
    if let Some(token) = auth.token() {
        backend = backend.with_token(token);
    }

    let services = Services::from_backend(Arc::new(auth), Arc::new(backend));
    let connection = ConnectionManager::with_websocket(settings.connection_config());
    let capture = AudioCapturePipeline::with_default_microphone(settings.capture_config());
    let mut coordinator = TestSessionCoordinator::new(services, connection, capture);

    let outcome = run_tasks(&mut coordinator, args).await;
    // A token we obtained ourselves is not left behind
    if signed_in_here {
        coordinator.logout().await;
    } else {
        coordinator.dispose().await;
    }
    outcome
}

async fn run_tasks(
    coordinator: &mut TestSessionCoordinator,
    args: &Args,
) -> Result<TestResult, TestError> {
    let session = coordinator.create_session(args.test_type, args.mode).await?;
    eprintln!("Session {} ({} {:?})", session.id, args.test_type, args.mode);

    let mut task = coordinator.start_task(None).await?;
    loop {
        let prep_secs = args
            .prep_secs
            .unwrap_or(phase_secs(task.preparation_secs, DEFAULT_PREP_SECS));
        let response_secs = args
            .response_secs
            .unwrap_or(phase_secs(task.response_secs, DEFAULT_RESPONSE_SECS));

        announce(&task, prep_secs, response_secs);
        tokio::time::sleep(Duration::from_secs(prep_secs.into())).await;

        coordinator.begin_response().await?;
        eprintln!("  Recording...");
        tokio::time::sleep(Duration::from_secs(response_secs.into())).await;

        let meta = ResponseMeta {
            preparation_used_ms: Some(u64::from(prep_secs) * 1000),
            notes: None,
        };
        let recording = coordinator.submit_response(None, meta).await?;
        eprintln!(
            "  Submitted {:.1}s of audio",
            recording.duration_ms as f64 / 1000.0
        );

        match coordinator.next_task().await? {
            NextStep::Task(next) => task = next,
            NextStep::Completed(result) => return Ok(result),
        }
    }
}

fn phase_secs(from_task: u32, fallback: u32) -> u32 {
    if from_task == 0 {
        fallback
    } else {
        from_task
    }
}

fn announce(task: &TaskContent, prep_secs: u32, response_secs: u32) {
    eprintln!();
    eprintln!("Task {} ({})", task.task_index, task.task_type);
    if let Some(reading) = &task.reading_text {
        eprintln!("{}", reading);
    }
    if let Some(url) = &task.listening_url {
        eprintln!("Listen: {}", url);
    }
    eprintln!("{}", task.prompt);
    eprintln!("  Prepare for {}s, then speak for {}s", prep_secs, response_secs);
}
