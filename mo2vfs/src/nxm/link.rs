//! Parsing of `nxm://` download URLs.
//!
//! `nxm://<game>/mods/<mod_id>/files/<file_id>?key=<k>&expires=<unix>&user_id=<n>`
//!
//! Every field is mandatory except `user_id`. Malformed paths, missing
//! fields and numeric overflow are all rejected; the handler never guesses.

use thiserror::Error;

/// Why a URL was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NxmParseError {
    #[error("not an nxm:// URL")]
    WrongScheme,

    #[error("missing game domain")]
    MissingDomain,

    #[error("unexpected path, expected mods/<mod_id>/files/<file_id>")]
    BadPath,

    #[error("invalid numeric field '{0}'")]
    BadNumber(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

/// A validated download link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NxmLink {
    pub game_domain: String,
    pub mod_id: u64,
    pub file_id: u64,
    pub key: String,
    pub expires: u64,
    pub user_id: Option<u64>,
}

impl NxmLink {
    /// Parse a raw URL line.
    pub fn parse(url: &str) -> Result<Self, NxmParseError> {
        let url = url.trim();
        const SCHEME: &str = "nxm://";
        let rest = match url.get(..SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &url[SCHEME.len()..],
            _ => return Err(NxmParseError::WrongScheme),
        };
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));

        let (domain, path) = location.split_once('/').ok_or(NxmParseError::BadPath)?;
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(NxmParseError::MissingDomain);
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() != 4 || segments[0] != "mods" || segments[2] != "files" {
            return Err(NxmParseError::BadPath);
        }

        let mod_id = parse_u64(segments[1])?;
        let file_id = parse_u64(segments[3])?;

        let mut key = None;
        let mut expires = None;
        let mut user_id = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "key" if !value.is_empty() => key = Some(value.to_string()),
                "expires" => expires = Some(parse_u64(value)?),
                "user_id" => user_id = Some(parse_u64(value)?),
                _ => {}
            }
        }

        Ok(NxmLink {
            game_domain: domain.to_string(),
            mod_id,
            file_id,
            key: key.ok_or(NxmParseError::MissingField("key"))?,
            expires: expires.ok_or(NxmParseError::MissingField("expires"))?,
            user_id,
        })
    }

    /// Stable key identifying the download across retries.
    pub fn lookup_key(&self) -> String {
        format!("{}:{}:{}", self.game_domain, self.mod_id, self.file_id)
    }
}

fn parse_u64(value: &str) -> Result<u64, NxmParseError> {
    value
        .parse::<u64>()
        .map_err(|_| NxmParseError::BadNumber(value.to_string()))
}
