//! Docker CLI wrapper for running built images as containers.

use std::net::TcpListener;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

pub const PORT_RANGE_START: u16 = 8000;
pub const PORT_ATTEMPTS: u16 = 100;

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("Docker command not found. Is Docker installed?")]
    NotInstalled,
    #[error("Timeout while {0}")]
    Timeout(&'static str),
    #[error("Failed {action}: {stderr}")]
    Command { action: &'static str, stderr: String },
    #[error("No available port found in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },
    #[error("Failed to run docker: {0}")]
    Io(std::io::Error),
}

impl DockerError {
    /// Docker no longer knows the container (removed outside NoHands).
    pub fn is_missing_container(&self) -> bool {
        matches!(self, DockerError::Command { stderr, .. } if stderr.contains("No such container"))
    }
}

/// First port in `start..start + max_attempts` that can be bound on localhost.
pub fn find_available_port(start: u16, max_attempts: u16) -> Result<u16, DockerError> {
    let end = start.saturating_add(max_attempts);
    (start..end)
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .ok_or(DockerError::NoFreePort { start, end })
}

/// Arguments for `docker run`.
pub fn run_args(
    image: &str,
    container_port: u16,
    host_port: u16,
    name: Option<&str>,
    env: &[(String, String)],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "-p".to_string(),
        format!("{host_port}:{container_port}"),
    ];
    if let Some(name) = name {
        args.push("--name".to_string());
        args.push(name.to_string());
    }
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(image.to_string());
    args
}

async fn docker(args: &[String], timeout_secs: u64, action: &'static str) -> Result<Output, DockerError> {
    run_with_timeout("docker", args, Duration::from_secs(timeout_secs), action).await
}

/// Run `program` to completion. The child is killed when `limit` expires.
async fn run_with_timeout(
    program: &str,
    args: &[String],
    limit: Duration,
    action: &'static str,
) -> Result<Output, DockerError> {
    let run = Command::new(program).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(limit, run).await {
        Err(_) => Err(DockerError::Timeout(action)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(DockerError::NotInstalled),
        Ok(Err(e)) => Err(DockerError::Io(e)),
        Ok(Ok(output)) => Ok(output),
    }
}

fn check(output: Output, action: &'static str) -> Result<Output, DockerError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(DockerError::Command {
            action,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Start `image` detached. Returns the container ID and the host port used.
pub async fn start_container(
    image: &str,
    container_port: u16,
    host_port: Option<u16>,
    name: Option<&str>,
    env: &[(String, String)],
) -> Result<(String, u16), DockerError> {
    let host_port = match host_port {
        Some(port) => port,
        None => find_available_port(PORT_RANGE_START, PORT_ATTEMPTS)?,
    };
    let args = run_args(image, container_port, host_port, name, env);
    let output = check(docker(&args, 30, "starting container").await?, "to start container")?;
    let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

    tracing::info!(
        container_id = %short_id(&container_id),
        image,
        host_port,
        "Started container"
    );
    Ok((container_id, host_port))
}

pub async fn stop_container(container_id: &str) -> Result<(), DockerError> {
    let args = ["stop".to_string(), container_id.to_string()];
    check(docker(&args, 30, "stopping container").await?, "to stop container")?;
    tracing::info!(container_id = %short_id(container_id), "Stopped container");
    Ok(())
}

pub async fn remove_container(container_id: &str, force: bool) -> Result<(), DockerError> {
    let mut args = vec!["rm".to_string()];
    if force {
        args.push("-f".to_string());
    }
    args.push(container_id.to_string());
    check(docker(&args, 30, "removing container").await?, "to remove container")?;
    Ok(())
}

/// Combined stdout and stderr of the container.
pub async fn container_logs(container_id: &str, tail: Option<u32>) -> Result<String, DockerError> {
    let mut args = vec!["logs".to_string()];
    if let Some(tail) = tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    args.push(container_id.to_string());
    let output = check(docker(&args, 30, "fetching logs").await?, "to get logs")?;
    Ok(format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    ))
}

/// Docker's `State.Status` for the container, or `unknown`.
pub async fn container_status(container_id: &str) -> String {
    let args = [
        "inspect".to_string(),
        "-f".to_string(),
        "{{.State.Status}}".to_string(),
        container_id.to_string(),
    ];
    match docker(&args, 10, "inspecting container").await {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => "unknown".to_string(),
    }
}

/// `docker load -i <tar>`; returns the loaded image reference.
pub async fn load_image_from_tar(tar_path: &Path) -> Result<String, DockerError> {
    let args = [
        "load".to_string(),
        "-i".to_string(),
        tar_path.to_string_lossy().into_owned(),
    ];
    let output = check(docker(&args, 120, "loading image").await?, "to load image")?;
    let image = parse_loaded_image(&String::from_utf8_lossy(&output.stdout));
    tracing::info!(image = %image, tar = %tar_path.display(), "Loaded image");
    Ok(image)
}

/// Image reference from `docker load` output (`Loaded image: name:tag`).
pub fn parse_loaded_image(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|line| line.split_once("Loaded image:"))
        .map(|(_, image)| image.trim().to_string())
        .unwrap_or_else(|| stdout.trim().to_string())
}

pub fn short_id(container_id: &str) -> &str {
    container_id.get(..12).unwrap_or(container_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_include_ports_name_and_env() {
        let env = vec![
            ("CSRF_TRUSTED_ORIGINS".to_string(), "https://ci.example.com".to_string()),
            ("DEBUG".to_string(), "1".to_string()),
        ];
        let args = run_args("web:abc12345", 8080, 8001, Some("nohands-build-3"), &env);
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "-p",
                "8001:8080",
                "--name",
                "nohands-build-3",
                "-e",
                "CSRF_TRUSTED_ORIGINS=https://ci.example.com",
                "-e",
                "DEBUG=1",
                "web:abc12345",
            ]
        );
    }

    #[test]
    fn run_args_without_name_or_env() {
        let args = run_args("img", 80, 8000, None, &[]);
        assert_eq!(args, vec!["run", "-d", "-p", "8000:80", "img"]);
    }

    #[test]
    fn parses_docker_load_output() {
        assert_eq!(parse_loaded_image("Loaded image: web:0123abcd\n"), "web:0123abcd");
        assert_eq!(
            parse_loaded_image("some progress\nLoaded image: registry/x:1\n"),
            "registry/x:1"
        );
        assert_eq!(parse_loaded_image("sha256:abc\n"), "sha256:abc");
    }

    #[test]
    fn finds_a_free_port_and_skips_taken_ones() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        if port < u16::MAX - 10 {
            let found = find_available_port(port, 10).unwrap();
            assert_ne!(found, port);
            assert!(found > port && found < port + 10);
        }
    }

    #[test]
    fn no_free_port_in_empty_range() {
        let err = find_available_port(9000, 0).unwrap_err();
        assert_eq!(err.to_string(), "No available port found in range 9000-9000");
    }

    #[test]
    fn short_id_is_twelve_chars() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let args = [
            "-c".to_string(),
            format!("sleep 1; touch '{}'", marker.display()),
        ];
        let err = run_with_timeout("sh", &args, Duration::from_millis(100), "sleeping")
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::Timeout("sleeping")));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let err = run_with_timeout("nohands-no-such-binary", &[], Duration::from_secs(5), "running")
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::NotInstalled));
    }

    #[test]
    fn recognizes_missing_containers() {
        let missing = DockerError::Command {
            action: "to stop container",
            stderr: "Error response from daemon: No such container: abc123".to_string(),
        };
        assert!(missing.is_missing_container());
        let other = DockerError::Command {
            action: "to stop container",
            stderr: "permission denied".to_string(),
        };
        assert!(!other.is_missing_container());
        assert!(!DockerError::Timeout("stopping container").is_missing_container());
    }
}
