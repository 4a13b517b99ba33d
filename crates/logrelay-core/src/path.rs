//! Connect-path grammars for the two relay endpoints.
//!
//! Device:    `/<tokenId>` | `/!notoken` | `/!notoken/<password>`
//! Inspector: `/<password?>/<!command?>/<tokenId?>/<expirationOverrideMs?>`
//!
//! The inspector password segment only exists when the relay is configured
//! with a password, so it is split off first with [`split_password`].

use crate::error::{RelayError, RelayResult};

/// Device path marker asking the relay to mint a fresh token.
pub const NO_TOKEN_MARKER: &str = "!notoken";
/// Longest token id an inspector may ask for.
pub const MAX_TOKEN_ID_LEN: usize = 100;
/// Largest expiration override an inspector may ask for, in milliseconds.
pub const MAX_EXPIRATION_OVERRIDE_MS: u64 = i64::MAX as u64;

/// Where a device wants to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    /// Mint a new token. `password` is the segment after the marker, if any.
    NoToken { password: Option<String> },
    /// Attach to an existing token.
    Token(String),
}

/// Commands an inspector can put in its path (`!list`, `!persist`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectorCommand {
    List,
    Persist,
}

impl InspectorCommand {
    fn parse(raw: &str) -> RelayResult<Self> {
        match raw {
            "list" => Ok(InspectorCommand::List),
            "persist" => Ok(InspectorCommand::Persist),
            other => Err(RelayError::InvalidPath(format!("unknown command: !{other}"))),
        }
    }
}

/// The part of an inspector path that follows the optional password.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectorRoute {
    pub command: Option<InspectorCommand>,
    pub token_id: Option<String>,
    /// Per-token expiration delay override, in milliseconds.
    pub expiration_override: Option<u64>,
}

fn trim_slashes(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}

/// Parse the path a device connected on.
pub fn parse_device_path(path: &str) -> RelayResult<DevicePath> {
    let trimmed = trim_slashes(path);
    if trimmed.is_empty() {
        return Err(RelayError::InvalidPath("empty device path".into()));
    }

    let mut segments = trimmed.split('/');
    let first = segments.next().unwrap_or_default();
    let second = segments.next();
    if segments.next().is_some() {
        return Err(RelayError::InvalidPath(format!("too many segments: {path}")));
    }

    if first == NO_TOKEN_MARKER {
        let password = second.filter(|p| !p.is_empty()).map(str::to_string);
        return Ok(DevicePath::NoToken { password });
    }

    if second.is_some() || first.is_empty() {
        return Err(RelayError::InvalidPath(format!("bad device path: {path}")));
    }
    Ok(DevicePath::Token(first.to_string()))
}

/// Split the leading password segment off an inspector path.
///
/// Returns the supplied password (if the path has any segment at all) and the
/// remainder of the path.
pub fn split_password(path: &str) -> (Option<&str>, &str) {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return (None, "");
    }
    match trimmed.split_once('/') {
        Some((password, rest)) => (Some(password), rest),
        None => (Some(trimmed), ""),
    }
}

/// Parse the command / token / expiration part of an inspector path.
pub fn parse_inspector_route(rest: &str) -> RelayResult<InspectorRoute> {
    let mut segments = rest.split('/').filter(|s| !s.is_empty()).peekable();
    let mut route = InspectorRoute::default();

    if let Some(command) = segments.peek().and_then(|s| s.strip_prefix('!')) {
        route.command = Some(InspectorCommand::parse(command)?);
        segments.next();
    }

    route.token_id = segments.next().map(str::to_string);

    if let Some(raw) = segments.next() {
        let delay = raw
            .parse::<u64>()
            .ok()
            .filter(|delay| *delay <= MAX_EXPIRATION_OVERRIDE_MS)
            .ok_or_else(|| {
                RelayError::InvalidPath(format!("bad expiration override: {raw:?}"))
            })?;
        route.expiration_override = Some(delay);
    }

    if let Some(extra) = segments.next() {
        return Err(RelayError::InvalidPath(format!("unexpected segment: {extra:?}")));
    }

    Ok(route)
}

/// Check that an inspector-supplied token id is short and lowercase-alphanumeric.
pub fn validate_token_id(id: &str) -> RelayResult<()> {
    if id.is_empty() {
        return Err(RelayError::InvalidTokenId("empty".into()));
    }
    if id.len() > MAX_TOKEN_ID_LEN {
        return Err(RelayError::InvalidTokenId(format!(
            "too long ({} > {MAX_TOKEN_ID_LEN})",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(RelayError::InvalidTokenId(format!("bad characters: {id:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        assert_eq!(
            parse_device_path("/abc123").unwrap(),
            DevicePath::Token("abc123".into())
        );
        assert_eq!(
            parse_device_path("/!notoken").unwrap(),
            DevicePath::NoToken { password: None }
        );
        assert_eq!(
            parse_device_path("/!notoken/hunter2").unwrap(),
            DevicePath::NoToken {
                password: Some("hunter2".into())
            }
        );
        assert!(parse_device_path("/").is_err());
        assert!(parse_device_path("/a/b").is_err());
        assert!(parse_device_path("/!notoken/pw/extra").is_err());
    }

    #[test]
    fn split_password_takes_first_segment() {
        assert_eq!(split_password("/pw/!list"), (Some("pw"), "!list"));
        assert_eq!(split_password("/pw"), (Some("pw"), ""));
        assert_eq!(split_password("/"), (None, ""));
    }

    #[test]
    fn inspector_plain_join() {
        let route = parse_inspector_route("abc123").unwrap();
        assert_eq!(route.command, None);
        assert_eq!(route.token_id.as_deref(), Some("abc123"));
        assert_eq!(route.expiration_override, None);
    }

    #[test]
    fn inspector_commands_and_override() {
        let route = parse_inspector_route("!persist/abc/60000").unwrap();
        assert_eq!(route.command, Some(InspectorCommand::Persist));
        assert_eq!(route.token_id.as_deref(), Some("abc"));
        assert_eq!(route.expiration_override, Some(60_000));

        let list = parse_inspector_route("!list").unwrap();
        assert_eq!(list.command, Some(InspectorCommand::List));
        assert_eq!(list.token_id, None);
    }

    #[test]
    fn inspector_route_errors() {
        assert!(parse_inspector_route("!shutdown/abc").is_err());
        assert!(parse_inspector_route("abc/soon").is_err());
        assert!(parse_inspector_route("abc/10/extra").is_err());
        assert!(parse_inspector_route("abc/-5").is_err());
    }

    #[test]
    fn expiration_override_is_bounded() {
        let max = format!("abc/{MAX_EXPIRATION_OVERRIDE_MS}");
        assert_eq!(
            parse_inspector_route(&max).unwrap().expiration_override,
            Some(MAX_EXPIRATION_OVERRIDE_MS)
        );
        let over = format!("abc/{}", MAX_EXPIRATION_OVERRIDE_MS + 1);
        assert!(parse_inspector_route(&over).is_err());
        assert!(parse_inspector_route("abc/18446744073709551615").is_err());
    }

    #[test]
    fn token_id_validation() {
        assert!(validate_token_id("abc123").is_ok());
        assert!(validate_token_id(&"a".repeat(MAX_TOKEN_ID_LEN)).is_ok());
        assert!(validate_token_id(&"a".repeat(MAX_TOKEN_ID_LEN + 1)).is_err());
        assert!(validate_token_id("").is_err());
        assert!(validate_token_id("ABC").is_err());
        assert!(validate_token_id("a-b").is_err());
        assert!(validate_token_id("é").is_err());
    }
}
