use std::time::Instant;

use tracing::{debug, warn};

use crate::app::AppState;
use crate::error::PatternError;
use crate::resp::Reply;
use crate::server::Session;
use crate::store::Store;

/// Every command the server understands. Names are case-sensitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Get,
    Set,
    Del,
    Exists,
    Keys,
    Save,
    BgSave,
    FlushDb,
    DbSize,
    Auth,
    Command,
}

impl CommandKind {
    pub(crate) fn from_name(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"GET" => CommandKind::Get,
            b"SET" => CommandKind::Set,
            b"DEL" => CommandKind::Del,
            b"EXISTS" => CommandKind::Exists,
            b"KEYS" => CommandKind::Keys,
            b"SAVE" => CommandKind::Save,
            b"BGSAVE" => CommandKind::BgSave,
            b"FLUSHDB" => CommandKind::FlushDb,
            b"DBSIZE" => CommandKind::DbSize,
            b"AUTH" => CommandKind::Auth,
            b"COMMAND" => CommandKind::Command,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            CommandKind::Get => "GET",
            CommandKind::Set => "SET",
            CommandKind::Del => "DEL",
            CommandKind::Exists => "EXISTS",
            CommandKind::Keys => "KEYS",
            CommandKind::Save => "SAVE",
            CommandKind::BgSave => "BGSAVE",
            CommandKind::FlushDb => "FLUSHDB",
            CommandKind::DbSize => "DBSIZE",
            CommandKind::Auth => "AUTH",
            CommandKind::Command => "COMMAND",
        }
    }

    fn allowed_before_auth(self) -> bool {
        matches!(self, CommandKind::Auth | CommandKind::Command)
    }
}

/// The invocation as it goes into the append log.
fn log_record(kind: CommandKind, args: &[Vec<u8>]) -> Vec<&[u8]> {
    std::iter::once(kind.name().as_bytes())
        .chain(args.iter().map(Vec::as_slice))
        .collect()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn cmd_get(args: &[Vec<u8>], store: &Store) -> Reply {
    let [key] = args else {
        return Reply::wrong_args("GET");
    };
    match store.read().await.get(key) {
        Some(value) => Reply::bulk(value),
        None => Reply::null(),
    }
}

async fn cmd_set(args: &[Vec<u8>], app: &AppState) -> Reply {
    let [key, value] = args else {
        return Reply::wrong_args("SET");
    };
    let mut db = app.store.write().await;
    db.set(key.clone(), value.clone());
    app.record_mutation(&log_record(CommandKind::Set, args));
    drop(db);
    debug!(key = %String::from_utf8_lossy(key), "SET");
    Reply::ok()
}

async fn cmd_del(args: &[Vec<u8>], app: &AppState) -> Reply {
    let mut db = app.store.write().await;
    let removed = db.remove_all(args.iter().map(Vec::as_slice));
    if removed > 0 {
        app.record_mutation(&log_record(CommandKind::Del, args));
    }
    drop(db);
    debug!(requested = args.len(), removed, "DEL");
    Reply::count(removed)
}

/// Duplicate arguments are counted each time they appear.
async fn cmd_exists(args: &[Vec<u8>], store: &Store) -> Reply {
    let db = store.read().await;
    Reply::count(args.iter().filter(|k| db.contains(k)).count())
}

async fn cmd_keys(args: &[Vec<u8>], store: &Store) -> Reply {
    let [pattern] = args else {
        return Reply::wrong_args("KEYS");
    };
    let db = store.read().await;

    let mut matched = Vec::new();
    let mut skipped = 0usize;
    let mut last_error = None;
    for key in db.keys() {
        match glob_match(pattern, key) {
            Ok(true) => matched.push(key.to_vec()),
            Ok(false) => {}
            Err(e) => {
                skipped += 1;
                last_error = Some(e);
            }
        }
    }
    drop(db);
    if let Some(e) = last_error {
        warn!(pattern = %String::from_utf8_lossy(pattern), skipped, error = %e, "malformed KEYS pattern, skipped keys");
    }
    Reply::bulks(matched)
}

async fn cmd_save(args: &[Vec<u8>], app: &AppState) -> Reply {
    if !args.is_empty() {
        return Reply::wrong_args("SAVE");
    }
    // Failures are logged by the snapshotter; the client still sees OK.
    let _ = app.snapshots.save(&app.store).await;
    Reply::ok()
}

async fn cmd_bgsave(args: &[Vec<u8>], app: &AppState) -> Reply {
    if !args.is_empty() {
        return Reply::wrong_args("BGSAVE");
    }
    match app.snapshots.start_background(&app.store).await {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::error(format!("ERR {e}")),
    }
}

async fn cmd_flushdb(args: &[Vec<u8>], app: &AppState) -> Reply {
    if !args.is_empty() {
        return Reply::wrong_args("FLUSHDB");
    }
    let mut db = app.store.write().await;
    db.clear();
    app.record_mutation(&log_record(CommandKind::FlushDb, args));
    drop(db);
    debug!("FLUSHDB");
    Reply::ok()
}

async fn cmd_dbsize(args: &[Vec<u8>], store: &Store) -> Reply {
    if !args.is_empty() {
        return Reply::wrong_args("DBSIZE");
    }
    Reply::count(store.read().await.len())
}

/// A wrong password drops any earlier authentication.
fn cmd_auth(args: &[Vec<u8>], app: &AppState, session: &mut Session) -> Reply {
    let [password] = args else {
        return Reply::wrong_args("AUTH");
    };
    match &app.config.password {
        None => Reply::error("ERR AUTH called without any password configured"),
        Some(expected) if expected.as_bytes() == password.as_slice() => {
            session.authenticated = true;
            debug!(client = session.id, "authenticated");
            Reply::ok()
        }
        Some(_) => {
            session.authenticated = false;
            warn!(client = session.id, "AUTH failed");
            Reply::error("ERR invalid password")
        }
    }
}

// ── Glob matching ─────────────────────────────────────────────────────────────

/// Returns true if `ch` is within the bracket-expression `class` (the content
/// between `[` and `]`, without the enclosing brackets).
/// Supports negation (`^` or `!`), literal bytes, and ranges (`a-z`).
fn class_match(class: &[u8], ch: u8) -> bool {
    let (negate, class) = match class.first() {
        Some(b'^') | Some(b'!') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut i = 0;
    let mut found = false;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == b'-' {
            if ch >= class[i] && ch <= class[i + 2] {
                found = true;
            }
            i += 3;
        } else {
            if ch == class[i] {
                found = true;
            }
            i += 1;
        }
    }
    if negate { !found } else { found }
}

/// Shell-style glob match supporting `*`, `?`, `[...]` / `[^...]` and `\`
/// escapes, byte by byte. Keys are flat, so `*` and `?` also match `/`.
fn glob_match(pattern: &[u8], text: &[u8]) -> Result<bool, PatternError> {
    match (pattern, text) {
        ([], []) => Ok(true),
        ([], _) => Ok(false),
        ([b'*', rest @ ..], _) => {
            // `*` matches zero or more bytes.
            if glob_match(rest, text)? {
                return Ok(true);
            }
            match text {
                [] => Ok(false),
                [_, t_rest @ ..] => glob_match(pattern, t_rest),
            }
        }
        ([b'\\'], _) => Err(PatternError::TrailingEscape),
        ([b'[', p_rest @ ..], _) => {
            let end = p_rest
                .iter()
                .position(|&c| c == b']')
                .ok_or(PatternError::UnclosedClass)?;
            match text {
                [] => Ok(false),
                [ch, t_rest @ ..] => {
                    Ok(class_match(&p_rest[..end], *ch) && glob_match(&p_rest[end + 1..], t_rest)?)
                }
            }
        }
        (_, []) => Ok(false),
        ([b'?', p_rest @ ..], [_, t_rest @ ..]) => glob_match(p_rest, t_rest),
        ([b'\\', lit, p_rest @ ..], [t, t_rest @ ..]) => Ok(lit == t && glob_match(p_rest, t_rest)?),
        ([p, p_rest @ ..], [t, t_rest @ ..]) => Ok(p == t && glob_match(p_rest, t_rest)?),
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

pub(crate) async fn dispatch(args: &[Vec<u8>], app: &AppState, session: &mut Session) -> Reply {
    let Some((name, rest)) = args.split_first() else {
        return Reply::error("ERR invalid command");
    };
    let kind = CommandKind::from_name(name);
    let name = String::from_utf8_lossy(name);

    if app.config.password.is_some()
        && !session.authenticated
        && !kind.is_some_and(CommandKind::allowed_before_auth)
    {
        debug!(client = session.id, command = %name, "rejected before AUTH");
        return Reply::error("NOAUTH authentication required");
    }
    let Some(kind) = kind else {
        debug!(client = session.id, command = %name, "unknown command");
        return Reply::error("ERR invalid command");
    };

    let start = Instant::now();
    let reply = match kind {
        CommandKind::Get => cmd_get(rest, &app.store).await,
        CommandKind::Set => cmd_set(rest, app).await,
        CommandKind::Del => cmd_del(rest, app).await,
        CommandKind::Exists => cmd_exists(rest, &app.store).await,
        CommandKind::Keys => cmd_keys(rest, &app.store).await,
        CommandKind::Save => cmd_save(rest, app).await,
        CommandKind::BgSave => cmd_bgsave(rest, app).await,
        CommandKind::FlushDb => cmd_flushdb(rest, app).await,
        CommandKind::DbSize => cmd_dbsize(rest, &app.store).await,
        CommandKind::Auth => cmd_auth(rest, app, session),
        CommandKind::Command => Reply::ok(),
    };
    metrics::histogram!("snapkv_command_duration_seconds", "command" => kind.name())
        .record(start.elapsed().as_secs_f64());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof;
    use crate::config::{Config, FsyncPolicy};
    use crate::persist;
    use crate::store::Db;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn make_app(config: Config) -> (TempDir, Arc<AppState>) {
        let dir = TempDir::new().unwrap();
        let config = Config { dir: dir.path().to_path_buf(), ..config };
        let app = AppState::open(config).await.unwrap();
        (dir, Arc::new(app))
    }

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    fn glob(pattern: &str, text: &str) -> Result<bool, PatternError> {
        glob_match(pattern.as_bytes(), text.as_bytes())
    }

    async fn run(app: &AppState, parts: &[&str]) -> Reply {
        dispatch(&args(parts), app, &mut Session::new()).await
    }

    fn key_set(reply: Reply) -> HashSet<Vec<u8>> {
        match reply {
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(s)) => s,
                    other => panic!("expected bulk string, got {other:?}"),
                })
                .collect(),
            other => panic!("expected array, got {other:?}"),
        }
    }

    fn set_of(keys: &[&str]) -> HashSet<Vec<u8>> {
        keys.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    #[test]
    fn names_are_case_sensitive() {
        assert_eq!(CommandKind::from_name(b"GET"), Some(CommandKind::Get));
        assert_eq!(CommandKind::from_name(b"get"), None);
        assert_eq!(CommandKind::from_name(b"BgSave"), None);
    }

    #[test]
    fn name_roundtrips_through_lookup() {
        for kind in [
            CommandKind::Get,
            CommandKind::Set,
            CommandKind::Del,
            CommandKind::Exists,
            CommandKind::Keys,
            CommandKind::Save,
            CommandKind::BgSave,
            CommandKind::FlushDb,
            CommandKind::DbSize,
            CommandKind::Auth,
            CommandKind::Command,
        ] {
            assert_eq!(CommandKind::from_name(kind.name().as_bytes()), Some(kind));
        }
    }

    #[tokio::test]
    async fn unknown_command_returns_error() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(run(&app, &["get", "k"]).await, Reply::error("ERR invalid command"));
        assert_eq!(run(&app, &["PING"]).await, Reply::error("ERR invalid command"));
        assert_eq!(run(&app, &[]).await, Reply::error("ERR invalid command"));
    }

    #[tokio::test]
    async fn command_is_a_noop() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(run(&app, &["COMMAND", "DOCS"]).await, Reply::ok());
    }

    // ── GET / SET / DEL / EXISTS ──────────────────────────────────────────────

    #[tokio::test]
    async fn set_then_get_returns_last_value() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(run(&app, &["SET", "a", "1"]).await, Reply::ok());
        assert_eq!(run(&app, &["SET", "b", "2"]).await, Reply::ok());
        assert_eq!(run(&app, &["SET", "a", "3"]).await, Reply::ok());
        assert_eq!(run(&app, &["GET", "a"]).await, Reply::bulk("3"));
        assert_eq!(run(&app, &["GET", "b"]).await, Reply::bulk("2"));
    }

    #[tokio::test]
    async fn get_missing_key_returns_null() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(run(&app, &["GET", "missing"]).await, Reply::null());
    }

    #[tokio::test]
    async fn empty_value_is_not_null() {
        let (_dir, app) = make_app(Config::default()).await;
        run(&app, &["SET", "k", ""]).await;
        assert_eq!(run(&app, &["GET", "k"]).await, Reply::bulk(""));
    }

    #[tokio::test]
    async fn arity_errors_name_the_command() {
        let (_dir, app) = make_app(Config::default()).await;
        let cases: &[(&[&str], &str)] = &[
            (&["GET"], "GET"),
            (&["GET", "a", "b"], "GET"),
            (&["SET", "k"], "SET"),
            (&["SET", "k", "v", "EX"], "SET"),
            (&["KEYS"], "KEYS"),
            (&["SAVE", "now"], "SAVE"),
            (&["BGSAVE", "x"], "BGSAVE"),
            (&["FLUSHDB", "ASYNC"], "FLUSHDB"),
            (&["DBSIZE", "x"], "DBSIZE"),
            (&["AUTH"], "AUTH"),
        ];
        for (parts, name) in cases {
            assert_eq!(run(&app, parts).await, Reply::wrong_args(name), "{parts:?}");
        }
    }

    #[tokio::test]
    async fn del_counts_removed_keys() {
        let (_dir, app) = make_app(Config::default()).await;
        run(&app, &["SET", "foo", "bar"]).await;
        assert_eq!(run(&app, &["DEL", "foo"]).await, Reply::Integer(1));
        assert_eq!(run(&app, &["GET", "foo"]).await, Reply::null());
        assert_eq!(run(&app, &["DEL", "foo"]).await, Reply::Integer(0));
        assert_eq!(run(&app, &["DEL"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn exists_counts_duplicates() {
        let (_dir, app) = make_app(Config::default()).await;
        run(&app, &["SET", "a", "1"]).await;
        assert_eq!(run(&app, &["EXISTS", "a", "a"]).await, Reply::Integer(2));
        assert_eq!(run(&app, &["EXISTS", "a", "b"]).await, Reply::Integer(1));
        assert_eq!(run(&app, &["EXISTS"]).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn flushdb_empties_table() {
        let (_dir, app) = make_app(Config::default()).await;
        for k in ["a", "b", "c"] {
            run(&app, &["SET", k, "v"]).await;
        }
        assert_eq!(run(&app, &["DBSIZE"]).await, Reply::Integer(3));
        assert_eq!(run(&app, &["FLUSHDB"]).await, Reply::ok());
        assert_eq!(run(&app, &["DBSIZE"]).await, Reply::Integer(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sets_are_not_lost() {
        let (_dir, app) = make_app(Config::default()).await;
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    let key = format!("key{i}");
                    let value = format!("value{i}");
                    dispatch(&args(&["SET", key.as_str(), value.as_str()]), &app, &mut Session::new()).await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Reply::ok());
        }
        assert_eq!(run(&app, &["DBSIZE"]).await, Reply::Integer(64));
        for i in 0..64 {
            let key = format!("key{i}");
            assert_eq!(run(&app, &["GET", key.as_str()]).await, Reply::bulk(format!("value{i}")));
        }
    }

    #[tokio::test]
    async fn binary_keys_and_values_roundtrip() {
        let (_dir, app) = make_app(Config::default()).await;
        let set = vec![b"SET".to_vec(), vec![0xfe, b'k'], vec![0xff, 0x00]];
        assert_eq!(dispatch(&set, &app, &mut Session::new()).await, Reply::ok());
        let get = vec![b"GET".to_vec(), vec![0xfe, b'k']];
        assert_eq!(
            dispatch(&get, &app, &mut Session::new()).await,
            Reply::bulk(vec![0xff, 0x00])
        );
        assert_eq!(key_set(run(&app, &["KEYS", "?k"]).await), HashSet::from([vec![0xfe, b'k']]));
    }

    // ── KEYS ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn keys_star_returns_every_key() {
        let (_dir, app) = make_app(Config::default()).await;
        for k in ["foo", "bar", "a/b"] {
            run(&app, &["SET", k, "v"]).await;
        }
        assert_eq!(key_set(run(&app, &["KEYS", "*"]).await), set_of(&["foo", "bar", "a/b"]));
    }

    #[tokio::test]
    async fn keys_question_mark_matches_exactly_one() {
        let (_dir, app) = make_app(Config::default()).await;
        for k in ["abc", "ac", "abcd"] {
            run(&app, &["SET", k, "v"]).await;
        }
        assert_eq!(key_set(run(&app, &["KEYS", "a?c"]).await), set_of(&["abc"]));
    }

    #[tokio::test]
    async fn keys_empty_table_returns_empty_array() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(run(&app, &["KEYS", "*"]).await, Reply::Array(Some(Vec::new())));
    }

    #[tokio::test]
    async fn keys_malformed_pattern_skips_instead_of_failing() {
        let (_dir, app) = make_app(Config::default()).await;
        for k in ["xa", "ab"] {
            run(&app, &["SET", k, "v"]).await;
        }
        // `xa` fails on the literal before reaching the broken class;
        // `ab` reaches it and is skipped.
        assert_eq!(key_set(run(&app, &["KEYS", "a[b"]).await), set_of(&[]));
    }

    #[test]
    fn glob_star_matches_anything() {
        assert_eq!(glob("*", "hello"), Ok(true));
        assert_eq!(glob("*", ""), Ok(true));
        assert_eq!(glob("h*o", "hello"), Ok(true));
        assert_eq!(glob("h*x", "hello"), Ok(false));
        assert_eq!(glob("user:*", "user:1/2"), Ok(true));
    }

    #[test]
    fn glob_question_mark_matches_one_char() {
        assert_eq!(glob("a?c", "abc"), Ok(true));
        assert_eq!(glob("a?c", "ac"), Ok(false));
        assert_eq!(glob("a?c", "abcd"), Ok(false));
        assert_eq!(glob_match(b"a?c", &[b'a', 0xff, b'c']), Ok(true));
    }

    #[test]
    fn glob_bracket_classes() {
        assert_eq!(glob("h[ae]llo", "hallo"), Ok(true));
        assert_eq!(glob("h[ae]llo", "hillo"), Ok(false));
        assert_eq!(glob("h[^e]llo", "hallo"), Ok(true));
        assert_eq!(glob("h[!e]llo", "hello"), Ok(false));
        assert_eq!(glob("h[a-c]llo", "hbllo"), Ok(true));
        assert_eq!(glob("h[a-c]llo", "hdllo"), Ok(false));
    }

    #[test]
    fn glob_escape_matches_literal() {
        assert_eq!(glob("a\\*", "a*"), Ok(true));
        assert_eq!(glob("a\\*", "ab"), Ok(false));
        assert_eq!(glob("\\[x", "[x"), Ok(true));
    }

    #[test]
    fn glob_malformed_patterns_error() {
        assert_eq!(glob("a[bc", "ab"), Err(PatternError::UnclosedClass));
        assert_eq!(glob("ab\\", "ab"), Err(PatternError::TrailingEscape));
        // Mismatch before the broken part is an ordinary non-match.
        assert_eq!(glob("z[bc", "ab"), Ok(false));
    }

    // ── AUTH ──────────────────────────────────────────────────────────────────

    fn with_password() -> Config {
        Config { password: Some("secret".into()), ..Config::default() }
    }

    #[tokio::test]
    async fn commands_require_auth_when_password_set() {
        let (_dir, app) = make_app(with_password()).await;
        let mut session = Session::new();
        let noauth = Reply::error("NOAUTH authentication required");
        assert_eq!(dispatch(&args(&["GET", "k"]), &app, &mut session).await, noauth);
        assert_eq!(dispatch(&args(&["BOGUS"]), &app, &mut session).await, noauth);
        assert_eq!(dispatch(&args(&["COMMAND"]), &app, &mut session).await, Reply::ok());

        assert_eq!(dispatch(&args(&["AUTH", "secret"]), &app, &mut session).await, Reply::ok());
        assert!(session.authenticated);
        assert_eq!(dispatch(&args(&["GET", "k"]), &app, &mut session).await, Reply::null());
    }

    #[tokio::test]
    async fn wrong_password_revokes_auth() {
        let (_dir, app) = make_app(with_password()).await;
        let mut session = Session::new();
        dispatch(&args(&["AUTH", "secret"]), &app, &mut session).await;
        assert!(session.authenticated);

        let reply = dispatch(&args(&["AUTH", "nope"]), &app, &mut session).await;
        assert_eq!(reply, Reply::error("ERR invalid password"));
        assert!(!session.authenticated);
        assert_eq!(
            dispatch(&args(&["GET", "k"]), &app, &mut session).await,
            Reply::error("NOAUTH authentication required")
        );
    }

    #[tokio::test]
    async fn auth_is_per_session() {
        let (_dir, app) = make_app(with_password()).await;
        let mut first = Session::new();
        let mut second = Session::new();
        dispatch(&args(&["AUTH", "secret"]), &app, &mut first).await;
        assert_eq!(
            dispatch(&args(&["DBSIZE"]), &app, &mut second).await,
            Reply::error("NOAUTH authentication required")
        );
        assert_eq!(dispatch(&args(&["DBSIZE"]), &app, &mut first).await, Reply::Integer(0));
    }

    #[tokio::test]
    async fn auth_without_password_configured() {
        let (_dir, app) = make_app(Config::default()).await;
        assert_eq!(
            run(&app, &["AUTH", "x"]).await,
            Reply::error("ERR AUTH called without any password configured")
        );
        assert_eq!(run(&app, &["GET", "k"]).await, Reply::null());
    }

    // ── Persistence side effects ──────────────────────────────────────────────

    #[tokio::test]
    async fn save_then_hydrate_reproduces_table() {
        let (dir, app) = make_app(Config::default()).await;
        run(&app, &["SET", "a", "1"]).await;
        run(&app, &["SET", "b", "2"]).await;
        assert_eq!(run(&app, &["SAVE"]).await, Reply::ok());
        run(&app, &["SET", "c", "after save"]).await;

        let loaded = persist::load(&dir.path().join("dump.rdb")).unwrap();
        let expected = HashMap::from([
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]);
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn bgsave_snapshots_table() {
        let (dir, app) = make_app(Config::default()).await;
        run(&app, &["SET", "k", "v"]).await;
        assert_eq!(run(&app, &["BGSAVE"]).await, Reply::ok());
        for _ in 0..200 {
            if !app.snapshots.is_background_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let loaded = persist::load(&dir.path().join("dump.rdb")).unwrap();
        assert_eq!(loaded.get(&b"k"[..]).map(Vec::as_slice), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn mutations_reach_append_log_in_order() {
        let config = Config {
            append_enabled: true,
            append_fsync: FsyncPolicy::Always,
            ..Config::default()
        };
        let (dir, app) = make_app(config).await;
        run(&app, &["SET", "a", "1"]).await;
        run(&app, &["SET", "b", "2"]).await;
        run(&app, &["DEL", "a", "zzz"]).await;
        run(&app, &["DEL", "missing"]).await;
        run(&app, &["GET", "b"]).await;

        let path = dir.path().join("appendonly.aof");
        let mut db = Db::new();
        let stats = aof::replay(&path, &mut db).await.unwrap();
        // SET, SET, DEL; the no-op DEL and the read are not logged.
        assert_eq!(stats.applied, 3);
        assert_eq!(db.get(b"b"), Some(&b"2"[..]));
        assert!(!db.contains(b"a"));
    }

    #[tokio::test]
    async fn mutations_bump_trackers_once_each() {
        let config = Config {
            snapshot_policies: vec![crate::config::SnapshotPolicy { interval_secs: 3600, min_changes: 1 }],
            ..Config::default()
        };
        let (_dir, app) = make_app(config).await;
        run(&app, &["SET", "a", "1"]).await;
        run(&app, &["SET", "b", "2"]).await;
        run(&app, &["DEL", "a", "b"]).await;
        run(&app, &["DEL", "a"]).await;
        run(&app, &["FLUSHDB"]).await;
        run(&app, &["GET", "a"]).await;
        assert_eq!(app.trackers[0].pending(), 4);
    }
}
