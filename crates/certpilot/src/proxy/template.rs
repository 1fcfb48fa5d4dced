//! Proxy configuration templates
//!
//! Templates are plain text with `{{name}}` placeholders. Any placeholder
//! left after rendering is an error, so a typo in a custom template fails
//! the variant before it reaches the proxy's own syntax check.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use certpilot_common::ProxyConfigVariant;
use certpilot_config::Config;

use super::ProxyError;

/// Embedded nginx template for [`ProxyConfigVariant::HttpOnly`]
pub const HTTP_ONLY_TEMPLATE: &str = r#"# Managed by certpilot (http-only). Changes are overwritten.
server {
    listen {{http_port}};
    listen [::]:{{http_port}};
    server_name {{domain}};

    location ^~ /.well-known/acme-challenge/ {
        root {{webroot}};
        default_type text/plain;
    }

    location / {
        proxy_pass {{backend}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }
}
"#;

/// Embedded nginx template for [`ProxyConfigVariant::TlsRedirect`]
pub const TLS_REDIRECT_TEMPLATE: &str = r#"# Managed by certpilot (tls-redirect). Changes are overwritten.
server {
    listen {{http_port}};
    listen [::]:{{http_port}};
    server_name {{domain}};

    location ^~ /.well-known/acme-challenge/ {
        root {{webroot}};
        default_type text/plain;
    }

    location / {
        return 301 https://$host$request_uri;
    }
}

server {
    listen {{https_port}} ssl;
    listen [::]:{{https_port}} ssl;
    server_name {{domain}};

    ssl_certificate {{cert_path}};
    ssl_certificate_key {{key_path}};
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_session_cache shared:certpilot:10m;

    location / {
        proxy_pass {{backend}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }
}
"#;

/// Values substituted into templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    pub domain: String,
    pub webroot: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub backend: String,
    pub http_port: u16,
    pub https_port: u16,
}

impl TemplateContext {
    /// Build the context from configuration and the live certificate paths
    pub fn new(config: &Config, cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            domain: config.domain().name.to_string(),
            webroot: config.acme.webroot.clone(),
            cert_path,
            key_path,
            backend: config.proxy.backend.clone(),
            http_port: config.proxy.http_port(),
            https_port: config.proxy.https_port(),
        }
    }

    fn pairs(&self) -> [(&'static str, String); 7] {
        [
            ("domain", self.domain.clone()),
            ("webroot", self.webroot.display().to_string()),
            ("cert_path", self.cert_path.display().to_string()),
            ("key_path", self.key_path.display().to_string()),
            ("backend", self.backend.clone()),
            ("http_port", self.http_port.to_string()),
            ("https_port", self.https_port.to_string()),
        ]
    }
}

/// The two variant templates
#[derive(Debug, Clone)]
pub struct TemplateSet {
    http_only: String,
    tls_redirect: String,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self {
            http_only: HTTP_ONLY_TEMPLATE.to_string(),
            tls_redirect: TLS_REDIRECT_TEMPLATE.to_string(),
        }
    }
}

impl TemplateSet {
    pub fn new(http_only: impl Into<String>, tls_redirect: impl Into<String>) -> Self {
        Self {
            http_only: http_only.into(),
            tls_redirect: tls_redirect.into(),
        }
    }

    /// Load configured template files, falling back to the embedded ones
    pub fn load(http_only: Option<&Path>, tls_redirect: Option<&Path>) -> Result<Self, ProxyError> {
        let read = |path: Option<&Path>, fallback: &str| match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading proxy template");
                fs::read_to_string(path).map_err(|e| ProxyError::io(path, e))
            }
            None => Ok(fallback.to_string()),
        };

        Ok(Self {
            http_only: read(http_only, HTTP_ONLY_TEMPLATE)?,
            tls_redirect: read(tls_redirect, TLS_REDIRECT_TEMPLATE)?,
        })
    }

    /// Render `variant` with `context`
    pub fn render(&self, variant: ProxyConfigVariant, context: &TemplateContext) -> Result<String, ProxyError> {
        let template = match variant {
            ProxyConfigVariant::HttpOnly => &self.http_only,
            ProxyConfigVariant::TlsRedirect => &self.tls_redirect,
        };

        let mut rendered = template.clone();
        for (name, value) in context.pairs() {
            rendered = rendered.replace(&format!("{{{{{}}}}}", name), &value);
        }

        if let Some(start) = rendered.find("{{") {
            let placeholder: String = rendered[start..]
                .split("}}")
                .next()
                .unwrap_or_default()
                .chars()
                .take(64)
                .collect();
            return Err(ProxyError::Config {
                variant,
                message: format!("unresolved placeholder '{}}}}}'", placeholder),
            });
        }

        Ok(rendered)
    }
}
