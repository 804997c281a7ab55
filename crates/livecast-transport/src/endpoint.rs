//! Destination URL parsing.

use url::Url;

use crate::error::TransportError;
use crate::TransportResult;

/// A parsed destination, resolved once per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    /// Lowercase scheme (`rtmp`, `rtmps`, `rtsp`, `rtsps`, `srt`).
    pub scheme: String,

    /// Host name or address.
    pub host: String,

    /// Port, defaulted per protocol when absent.
    pub port: u16,

    /// Path including the leading slash.
    pub path: String,

    /// Raw query string, without `?`.
    pub query: Option<String>,

    /// User from the URL userinfo.
    pub user: Option<String>,

    /// Password from the URL userinfo.
    pub password: Option<String>,

    url: String,
}

impl StreamEndpoint {
    /// Parse an endpoint URL.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", url, e)))?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing host in {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = match parsed.port().or_else(|| default_port(&scheme)) {
            Some(port) => port,
            None => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "missing port in {}, should be: {}://host:port",
                    url, scheme
                )))
            }
        };

        let user = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = parsed.password().map(str::to_string);

        Ok(Self {
            scheme,
            host,
            port,
            path: parsed.path().to_string(),
            query: parsed.query().map(str::to_string),
            user,
            password,
            url: url.to_string(),
        })
    }

    /// The URL this endpoint was parsed from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host:port` for socket connection.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Returns true for TLS schemes.
    pub fn is_tls(&self) -> bool {
        self.scheme == "rtmps" || self.scheme == "rtsps"
    }

    /// Credentials embedded in the URL.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }

    /// Split an RTMP path into application name and stream key.
    ///
    /// `/live/key` gives `("live", "key")`, `/app/inst/key?token=1` gives
    /// `("app/inst", "key?token=1")`.
    pub fn rtmp_app_and_key(&self) -> TransportResult<(String, String)> {
        let trimmed = self.path.trim_matches('/');
        let (app, key) = trimmed.rsplit_once('/').ok_or_else(|| {
            TransportError::InvalidEndpoint(format!(
                "{}, should be: rtmp://host:port/appname/streamname",
                self.url
            ))
        })?;
        if app.is_empty() || key.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!(
                "{}, should be: rtmp://host:port/appname/streamname",
                self.url
            )));
        }

        let key = match self.query {
            Some(ref query) => format!("{}?{}", key, query),
            None => key.to_string(),
        };
        Ok((app.to_string(), key))
    }

    /// RTMP `tcUrl` for the application.
    pub fn rtmp_tc_url(&self, app: &str) -> String {
        format!("{}://{}:{}/{}", self.scheme, self.host, self.port, app)
    }

    /// RTSP request URL without credentials.
    pub fn rtsp_url(&self) -> String {
        let mut url = format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path);
        if let Some(ref query) = self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// SRT stream id from `?streamid=` or, failing that, the path.
    pub fn srt_stream_id(&self) -> Option<String> {
        if let Some(ref query) = self.query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("streamid=") {
                    return Some(value.to_string());
                }
            }
        }
        let path = self.path.trim_start_matches('/');
        if path.is_empty() {
            None
        } else {
            Some(path.to_string())
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtmp" => Some(1935),
        "rtmps" => Some(443),
        "rtsp" => Some(554),
        "rtsps" => Some(322),
        _ => None,
    }
}
