use super::WorkerContext;
use crate::error::{AppError, AppResult};
use crate::logging::LogLevel;
use crate::runner::{DeployConfig, DeployReport, TaskResult};
use crate::ssh::{shell_quote, RemoteSession};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STEPS: u32 = 7;
const BUNDLED_SCRIPT: &str = include_str!("../../assets/deploy_llm_server.py");
const BUNDLED_SCRIPT_NAME: &str = "deploy_llm_server.py";
const MIN_FREE_KB: u64 = 10 * 1024 * 1024;

/// Install and start the LLM server on the remote host.
pub async fn run(ctx: &WorkerContext, config: DeployConfig) -> AppResult<TaskResult> {
    ctx.progress(format!("Connecting to {}", config.target.address()), 1, STEPS);
    let session = ctx.connect(&config.target).await?;

    let result = deploy(ctx, &config, session.as_ref()).await;
    session.close().await;
    result.map(TaskResult::Deployed)
}

async fn deploy(ctx: &WorkerContext, config: &DeployConfig, session: &dyn RemoteSession) -> AppResult<DeployReport> {
    ctx.progress("Checking prerequisites", 2, STEPS);
    let warnings = check_prerequisites(ctx, config, session).await?;

    let path = shell_quote(&config.deploy_path);
    ctx.progress(format!("Preparing {}", config.deploy_path), 3, STEPS);
    ctx.run_checked(session, &format!("mkdir -p {path} && test -w {path}")).await?;

    ctx.progress("Uploading deploy script", 4, STEPS);
    let remote_script = upload_script(ctx, config, session).await?;

    ctx.progress("Running deploy script", 5, STEPS);
    run_script(ctx, config, session, &remote_script).await?;

    ctx.progress("Verifying server process", 6, STEPS);
    ctx.run_checked(session, "pgrep -f 'ollama serve'").await?;

    ctx.progress(format!("Verifying port {} is listening", config.llm_port), 7, STEPS);
    ctx.run_checked(session, &listening_command(config.llm_port)).await?;

    ctx.log(
        LogLevel::Info,
        format!("LLM server deployed to {} on port {}", config.deploy_path, config.llm_port),
    );
    Ok(DeployReport {
        deploy_path: config.deploy_path.clone(),
        llm_port: config.llm_port,
        remote_script,
        warnings,
    })
}

/// Only a missing runtime is fatal; everything else becomes a warning.
async fn check_prerequisites(
    ctx: &WorkerContext,
    config: &DeployConfig,
    session: &dyn RemoteSession,
) -> AppResult<Vec<String>> {
    let runtime = ctx.run_checked(session, "python3 --version").await?;
    ctx.log(LogLevel::Info, format!("Runtime: {}", runtime.stdout.trim()));

    let mut warnings = Vec::new();

    let pip = ctx.exec(session, "python3 -m pip --version").await?;
    if !pip.success() {
        warnings.push("pip is not available for python3".to_string());
    }

    let parent = Path::new(&config.deploy_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    let df = ctx
        .exec(session, &format!("df -Pk {} | tail -1", shell_quote(&parent)))
        .await?;
    match parse_df_available_kb(&df.stdout) {
        Some(kb) if kb < MIN_FREE_KB => warnings.push(format!(
            "only {} MB free under {}",
            kb / 1024,
            parent
        )),
        Some(_) => {}
        None => warnings.push(format!("could not determine free space under {}", parent)),
    }

    let port = ctx.exec(session, &listening_command(config.llm_port)).await?;
    if port.success() {
        warnings.push(format!("port {} is already in use", config.llm_port));
    }

    for warning in &warnings {
        ctx.log(LogLevel::Warn, warning.clone());
    }
    Ok(warnings)
}

/// Uploads the configured or bundled script and returns its remote path
async fn upload_script(ctx: &WorkerContext, config: &DeployConfig, session: &dyn RemoteSession) -> AppResult<String> {
    match &config.script_path {
        Some(local) => {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| BUNDLED_SCRIPT_NAME.to_string());
            let remote = remote_join(&config.deploy_path, &name);
            ctx.guard(
                ctx.settings().ssh.command_timeout(),
                "script upload",
                session.transfer(local, &remote),
            )
            .await?;
            Ok(remote)
        }
        None => {
            let local = write_bundled_script()?;
            let remote = remote_join(&config.deploy_path, BUNDLED_SCRIPT_NAME);
            let uploaded = ctx
                .guard(
                    ctx.settings().ssh.command_timeout(),
                    "script upload",
                    session.transfer(&local, &remote),
                )
                .await;
            let _ = std::fs::remove_file(&local);
            uploaded.map(|_| remote)
        }
    }
}

fn write_bundled_script() -> AppResult<PathBuf> {
    let path = std::env::temp_dir().join(format!("llmdock_deploy_{}.py", Uuid::new_v4()));
    std::fs::write(&path, BUNDLED_SCRIPT)?;
    Ok(path)
}

fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

async fn run_script(
    ctx: &WorkerContext,
    config: &DeployConfig,
    session: &dyn RemoteSession,
    remote_script: &str,
) -> AppResult<()> {
    let command = script_command(config, remote_script);
    let output = ctx.exec(session, &command).await?;

    let mut script_error: Option<String> = None;
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
        match parse_script_line(line) {
            Some(ScriptEvent::Progress { progress, message }) => ctx.log_from(
                LogLevel::Info,
                format!("[{:>3}%] {}", progress.clamp(0.0, 100.0) as u32, message),
                "deploy-script",
            ),
            Some(ScriptEvent::Log { level, message }) => {
                ctx.log_from(LogLevel::parse(&level), message, "deploy-script")
            }
            Some(ScriptEvent::Complete { message }) => {
                ctx.log_from(LogLevel::Info, message, "deploy-script")
            }
            Some(ScriptEvent::Error { message }) => {
                ctx.log_from(LogLevel::Error, message.clone(), "deploy-script");
                script_error = Some(message);
            }
            None => ctx.log_from(LogLevel::Debug, line.to_string(), "deploy-script"),
        }
    }

    if output.success() && script_error.is_none() {
        return Ok(());
    }
    let stderr = match script_error {
        Some(message) if output.stderr.trim().is_empty() => message,
        Some(message) => format!("{}\n{}", message, output.stderr.trim()),
        None => output.stderr.trim().to_string(),
    };
    Err(AppError::RemoteCommand {
        command,
        exit_status: if output.exit_code == 0 { 1 } else { output.exit_code },
        stderr,
    })
}

fn script_command(config: &DeployConfig, remote_script: &str) -> String {
    let interpreter = if remote_script.ends_with(".py") {
        "python3 "
    } else if remote_script.ends_with(".sh") {
        "sh "
    } else {
        ""
    };
    format!(
        "cd {dir} && {interpreter}{script} --port {port} --host {host} --install-path {dir} --models {models}",
        dir = shell_quote(&config.deploy_path),
        script = shell_quote(remote_script),
        port = config.llm_port,
        host = shell_quote(&config.listen_host),
        models = shell_quote(&config.models.join(",")),
    )
}

/// Exits 0 when something listens on `port`
fn listening_command(port: u16) -> String {
    format!(
        "(ss -ltn 2>/dev/null || netstat -ltn 2>/dev/null) | grep -Eq ':{}([^0-9]|$)'",
        port
    )
}

fn parse_df_available_kb(output: &str) -> Option<u64> {
    output.split_whitespace().nth(3)?.parse().ok()
}

/// One JSON line from the deploy script
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ScriptEvent {
    Progress {
        #[serde(default)]
        progress: f64,
        #[serde(default)]
        message: String,
    },
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        message: String,
    },
    Complete {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

fn parse_script_line(line: &str) -> Option<ScriptEvent> {
    serde_json::from_str(line.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SshTarget;

    fn config() -> DeployConfig {
        DeployConfig {
            server_id: "s1".into(),
            target: SshTarget {
                host: "h".into(),
                port: 22,
                username: "u".into(),
                private_key_path: None,
                passphrase: None,
                password: Some("p".into()),
            },
            deploy_path: "/opt/llm".into(),
            llm_port: 11434,
            listen_host: "0.0.0.0".into(),
            models: vec!["llama2:7b".into(), "mistral".into()],
            script_path: None,
        }
    }

    #[test]
    fn test_parse_script_lines() {
        assert_eq!(
            parse_script_line(r#"{"type":"progress","progress":40,"message":"ollama installed","timestamp":1.5}"#),
            Some(ScriptEvent::Progress {
                progress: 40.0,
                message: "ollama installed".into()
            })
        );
        assert_eq!(
            parse_script_line(r#"{"type":"error","success":false,"message":"curl is required"}"#),
            Some(ScriptEvent::Error {
                message: "curl is required".into()
            })
        );
        assert_eq!(parse_script_line("Downloading... 45%"), None);
        assert_eq!(parse_script_line(r#"{"type":"unknown"}"#), None);
    }

    #[test]
    fn test_script_command() {
        assert_eq!(
            script_command(&config(), "/opt/llm/deploy_llm_server.py"),
            "cd '/opt/llm' && python3 '/opt/llm/deploy_llm_server.py' --port 11434 --host '0.0.0.0' \
             --install-path '/opt/llm' --models 'llama2:7b,mistral'"
        );
    }

    #[test]
    fn test_parse_df() {
        let line = "/dev/sda1 102400000 51200000 51200000 50% /opt";
        assert_eq!(parse_df_available_kb(line), Some(51_200_000));
        assert_eq!(parse_df_available_kb("garbage"), None);
    }

    #[test]
    fn test_bundled_script_speaks_jsonl() {
        assert!(BUNDLED_SCRIPT.contains("\"progress\""));
        assert!(BUNDLED_SCRIPT.contains("--install-path"));
        assert_eq!(remote_join("/opt/llm/", BUNDLED_SCRIPT_NAME), "/opt/llm/deploy_llm_server.py");
    }
}
