//! Credential exchange helpers: RTSP Basic and Digest, RTMP Adobe.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;

/// `Authorization` value for HTTP Basic.
pub fn basic_authorization(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

/// A `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Digest(DigestChallenge),
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            Some(Self::Basic)
        } else if scheme.eq_ignore_ascii_case("digest") {
            DigestChallenge::parse(params).map(Self::Digest)
        } else {
            None
        }
    }

    /// `Authorization` header value answering this challenge.
    pub fn authorization(&self, user: &str, password: &str, method: &str, uri: &str) -> String {
        match self {
            Self::Basic => basic_authorization(user, password),
            Self::Digest(digest) => digest.authorization(user, password, method, uri),
        }
    }
}

/// Parameters of a Digest challenge (RFC 2617, MD5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse the comma separated `key="value"` list after `Digest`.
    pub fn parse(params: &str) -> Option<Self> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;

        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
        })
    }

    /// Compute the MD5 response.
    pub fn response(
        &self,
        user: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
        nc: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", user, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        if self.qop_auth {
            md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        }
    }

    /// `Authorization` header value for one request.
    pub fn authorization(&self, user: &str, password: &str, method: &str, uri: &str) -> String {
        let cnonce = format!("{:08x}", rand::thread_rng().gen::<u32>());
        let nc = "00000001";
        let response = self.response(user, password, method, uri, &cnonce, nc);

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            user, self.realm, self.nonce, uri, response
        );
        if self.qop_auth {
            value.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(ref opaque) = self.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value
    }
}

fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, remaining)) => (value.to_string(), remaining),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.split_once(',') {
                Some((value, remaining)) => (value.trim().to_string(), remaining),
                None => (after.trim().to_string(), ""),
            }
        };

        out.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

/// Adobe challenge-response authentication for RTMP (`authmod=adobe`).
///
/// The server rejects `connect` with a description carrying the next
/// step; the client reconnects with the query string for that step
/// appended to the application name.
pub mod adobe {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use rand::Rng;

    /// What a rejected `connect` asks for.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum AdobeStep {
        /// The server wants Adobe auth; reconnect announcing the user.
        NeedUser,

        /// The server sent salt and challenge; reconnect with a response.
        Challenge {
            salt: String,
            challenge: Option<String>,
            opaque: Option<String>,
        },

        /// Credentials rejected.
        Failed,
    }

    /// Interpret a `connect` rejection description. Returns `None` when
    /// the rejection is not about authentication.
    pub fn parse_rejection(description: &str) -> Option<AdobeStep> {
        if description.contains("reason=authfailed") || description.contains("reason=nosuchuser")
        {
            return Some(AdobeStep::Failed);
        }

        if description.contains("reason=needauth") {
            let query = description.split_once('?').map(|(_, q)| q).unwrap_or("");
            let mut salt = None;
            let mut challenge = None;
            let mut opaque = None;
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = value.trim().to_string();
                match key {
                    "salt" => salt = Some(value),
                    "challenge" => challenge = Some(value),
                    "opaque" => opaque = Some(value),
                    _ => {}
                }
            }
            return match salt {
                Some(salt) => Some(AdobeStep::Challenge {
                    salt,
                    challenge,
                    opaque,
                }),
                None => Some(AdobeStep::Failed),
            };
        }

        if description.contains("code=403 need auth") || description.contains("authmod=adobe") {
            return Some(AdobeStep::NeedUser);
        }

        None
    }

    /// Query announcing `user` for the first round.
    pub fn user_query(user: &str) -> String {
        format!("?authmod=adobe&user={}", user)
    }

    /// Query answering a challenge.
    pub fn response_query(
        user: &str,
        password: &str,
        salt: &str,
        challenge: Option<&str>,
        opaque: Option<&str>,
    ) -> String {
        let client_challenge = format!("{:08x}", rand::thread_rng().gen::<u32>());
        let response = response(user, password, salt, challenge, opaque, &client_challenge);

        let mut query = format!(
            "?authmod=adobe&user={}&challenge={}&response={}",
            user, client_challenge, response
        );
        if let Some(opaque) = opaque.filter(|o| !o.is_empty()) {
            query.push_str("&opaque=");
            query.push_str(opaque);
        }
        query
    }

    /// `base64(md5(base64(md5(user salt password)) (opaque|challenge) client_challenge))`
    pub fn response(
        user: &str,
        password: &str,
        salt: &str,
        challenge: Option<&str>,
        opaque: Option<&str>,
        client_challenge: &str,
    ) -> String {
        let mut hash = STANDARD.encode(md5::compute(format!("{}{}{}", user, salt, password)).0);
        match (opaque.filter(|o| !o.is_empty()), challenge) {
            (Some(opaque), _) => hash.push_str(opaque),
            (None, Some(challenge)) => hash.push_str(challenge),
            (None, None) => {}
        }
        hash.push_str(client_challenge);
        STANDARD.encode(md5::compute(hash).0)
    }
}
