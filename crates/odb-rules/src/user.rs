//! User naming: nicknames and `nickname:site` logins.

/// Whether `name` is usable as a nickname: non-blank, made of letters,
/// digits, spaces and `$_.-`.
pub fn validate_nickname(name: &str) -> bool {
    if name.trim().is_empty() {
        return false;
    }
    name.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '$' | '_' | '.' | '-'))
}

/// Site part of `nickname:site`, `""` for a plain nickname.
pub fn site_from_user(user: &str) -> &str {
    user.split_once(':').map_or("", |(_, site)| site)
}

/// Nickname part of `nickname:site`.
pub fn nickname_from_user(user: &str) -> &str {
    user.split_once(':').map_or(user, |(nick, _)| nick)
}

pub fn user_from_nickname_and_site(nickname: &str, site: &str) -> String {
    format!("{nickname}:{site}")
}
