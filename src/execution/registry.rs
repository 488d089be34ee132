//! Registry credential check.
//!
//! Performs the Docker registry v2 login handshake: probe `/v2/`, follow the
//! `WWW-Authenticate` challenge, and for token-based registries request an
//! offline token. The refresh token returned by the token service is the
//! identity token the engine accepts in place of a password.

use bollard::auth::DockerCredentials;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Server address used when credentials name no registry.
pub const DEFAULT_REGISTRY: &str = "https://index.docker.io/v1/";

const DOCKER_HUB_API: &str = "https://registry-1.docker.io";
const CLIENT_ID: &str = "fnbox";

/// Authentication scheme announced by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Maps a credential server address to the registry's v2 API base URL.
pub fn registry_base_url(server_address: &str) -> String {
    let address = server_address.trim();
    if address.is_empty() || address.contains("index.docker.io") || address == "docker.io" {
        return DOCKER_HUB_API.to_string();
    }

    let with_scheme = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{address}")
    };

    let trimmed = with_scheme.trim_end_matches('/');
    trimmed
        .strip_suffix("/v1")
        .or_else(|| trimmed.strip_suffix("/v2"))
        .unwrap_or(trimmed)
        .to_string()
}

/// Parses a `WWW-Authenticate` header value.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    for param in params.split(',') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }

    realm.map(|realm| Challenge::Bearer { realm, service })
}

fn token_url(realm: &str, service: Option<&str>, account: &str) -> String {
    let separator = if realm.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{realm}{separator}client_id={CLIENT_ID}&offline_token=true&account={}",
        urlencoding::encode(account)
    );
    if let Some(service) = service {
        url.push_str("&service=");
        url.push_str(&urlencoding::encode(service));
    }
    url
}

fn request_failed(e: reqwest::Error) -> ProvisionError {
    ProvisionError::Registry(format!("request failed: {e}"))
}

async fn basic_login(
    http: &reqwest::Client,
    probe_url: &str,
    base: &str,
    account: &str,
    password: &str,
) -> Result<(), ProvisionError> {
    let response = http
        .get(probe_url)
        .basic_auth(account, Some(password))
        .send()
        .await
        .map_err(request_failed)?;
    if !response.status().is_success() {
        return Err(ProvisionError::Registry(format!(
            "invalid username or password for {base} ({})",
            response.status()
        )));
    }
    info!(registry = %base, account = %account, "Registry login succeeded");
    Ok(())
}

/// Validates `credentials` against their registry.
///
/// Returns the identity token when the registry hands one out.
///
/// # Errors
///
/// Returns `ProvisionError::Registry` when the registry rejects the
/// credentials or cannot be reached.
pub async fn login(
    http: &reqwest::Client,
    credentials: &DockerCredentials,
) -> Result<Option<String>, ProvisionError> {
    let account = credentials
        .username
        .as_deref()
        .filter(|u| !u.is_empty())
        .or(credentials.email.as_deref())
        .unwrap_or_default();
    let password = credentials.password.as_deref().unwrap_or_default();
    let base = registry_base_url(credentials.serveraddress.as_deref().unwrap_or(DEFAULT_REGISTRY));
    let probe_url = format!("{base}/v2/");

    let probe = http.get(&probe_url).send().await.map_err(request_failed)?;
    if probe.status().is_success() {
        debug!(registry = %base, "Registry accepts anonymous access");
        if account.is_empty() && password.is_empty() {
            return Ok(None);
        }
        // Anonymous access says nothing about the credentials themselves
        basic_login(http, &probe_url, &base, account, password).await?;
        return Ok(None);
    }
    if probe.status() != StatusCode::UNAUTHORIZED {
        return Err(ProvisionError::Registry(format!(
            "{base} answered the login probe with {}",
            probe.status()
        )));
    }

    let challenge = probe
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_challenge)
        .ok_or_else(|| {
            ProvisionError::Registry(format!("{base} sent no usable authentication challenge"))
        })?;

    match challenge {
        Challenge::Basic => {
            basic_login(http, &probe_url, &base, account, password).await?;
            Ok(None)
        }
        Challenge::Bearer { realm, service } => {
            let response = http
                .get(token_url(&realm, service.as_deref(), account))
                .basic_auth(account, Some(password))
                .send()
                .await
                .map_err(request_failed)?;
            if !response.status().is_success() {
                return Err(ProvisionError::Registry(format!(
                    "invalid username or password for {base} ({})",
                    response.status()
                )));
            }
            let token: TokenResponse = response.json().await.map_err(request_failed)?;
            info!(registry = %base, account = %account, "Registry login succeeded");
            Ok(token.refresh_token.filter(|t| !t.is_empty()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `/v2/` anonymously, and checks basic auth when a client sends it.
    /// Only `me:right` is accepted.
    async fn spawn_open_registry() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buffer = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buffer).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buffer[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&request).to_ascii_lowercase();
                    let status = match head
                        .lines()
                        .find_map(|line| line.strip_prefix("authorization:"))
                    {
                        None => "200 OK",
                        Some(value) if value.trim() == "basic bwu6cmlnahq=" => "200 OK",
                        Some(_) => "401 Unauthorized",
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{address}")
    }

    fn credentials(server: &str, password: &str) -> DockerCredentials {
        DockerCredentials {
            username: Some("me".to_string()),
            password: Some(password.to_string()),
            serveraddress: Some(server.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password_on_open_registry() {
        let server = spawn_open_registry().await;
        let http = reqwest::Client::new();

        let err = login(&http, &credentials(&server, "definitely-wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Registry(_)));

        let token = login(&http, &credentials(&server, "right")).await.unwrap();
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn test_login_without_credentials_on_open_registry() {
        let server = spawn_open_registry().await;
        let anonymous = DockerCredentials {
            serveraddress: Some(server),
            ..Default::default()
        };

        let token = login(&reqwest::Client::new(), &anonymous).await.unwrap();
        assert_eq!(token, None);
    }

    #[test]
    fn test_registry_base_url() {
        assert_eq!(registry_base_url(DEFAULT_REGISTRY), DOCKER_HUB_API);
        assert_eq!(registry_base_url(""), DOCKER_HUB_API);
        assert_eq!(registry_base_url("docker.io"), DOCKER_HUB_API);
        assert_eq!(
            registry_base_url("registry.example.com:5000"),
            "https://registry.example.com:5000"
        );
        assert_eq!(
            registry_base_url("http://localhost:5000/v2/"),
            "http://localhost:5000"
        );
        assert_eq!(registry_base_url("https://ghcr.io/"), "https://ghcr.io");
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge =
            parse_challenge(r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#);
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenge() {
        assert_eq!(parse_challenge(r#"Basic realm="Registry""#), Some(Challenge::Basic));
        assert_eq!(parse_challenge("Negotiate"), None);
        assert_eq!(parse_challenge("Bearer service=\"x\""), None);
    }

    #[test]
    fn test_token_url() {
        let url = token_url("https://auth.example.com/token", Some("reg example"), "me@x.io");
        assert_eq!(
            url,
            "https://auth.example.com/token?client_id=fnbox&offline_token=true&account=me%40x.io&service=reg%20example"
        );

        let url = token_url("https://auth.example.com/token?scope=x", None, "bob");
        assert!(url.starts_with("https://auth.example.com/token?scope=x&client_id=fnbox"));
    }
}
