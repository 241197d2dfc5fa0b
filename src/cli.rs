use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::app::{App, NoticeLevel, Options, Services};
use crate::config::{self, Config};
use crate::models::{
    Channel, Entry, Feed, FeedKey, FeedType, FormatMode, Message, NewChannel, SCHEDULE_PERIODS,
};
use crate::session;
use crate::storage;

/// How long a command waits for its background requests.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// pourover: publish feeds to broadcast channels
#[derive(Parser, Debug)]
#[command(name = "pourover", version)]
#[command(about = "Publish feeds to broadcast channels", long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Config file (default: <config dir>/pourover/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Store the access token from an OAuth redirect url
    Login {
        /// Redirect url carrying `#access_token=...`
        redirect_url: String,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// List feeds
    Feeds,
    /// Show a feed and its entries
    Show {
        #[command(flatten)]
        feed: FeedRef,
    },
    /// Preview posts for a feed url
    Preview {
        url: String,
        #[command(flatten)]
        flags: FeedFlags,
    },
    /// Create a feed
    Create {
        url: String,
        #[command(flatten)]
        flags: FeedFlags,
    },
    /// Update a feed
    Update {
        #[command(flatten)]
        feed: FeedRef,
        #[command(flatten)]
        flags: FeedFlags,
    },
    /// Delete a feed
    Delete {
        #[command(flatten)]
        feed: FeedRef,
    },
    /// Publish an entry now
    Publish {
        #[command(flatten)]
        feed: FeedRef,
        entry_id: String,
    },
    /// List broadcast channels
    Channels,
    /// Show a broadcast channel and its messages
    Channel { id: String },
    /// Post a message to a broadcast channel
    Send { id: String, text: String },
    /// Create a broadcast channel
    CreateChannel {
        title: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// Subscribe to a channel
    Subscribe { id: String },
    /// Unsubscribe from a channel
    Unsubscribe { id: String },
}

/// A saved feed, named by type (name or code) and id.
#[derive(Args, Debug, Clone, Copy, PartialEq)]
pub struct FeedRef {
    /// rss, instagram, broadcast or their codes 1-3
    #[arg(value_name = "TYPE", value_parser = parse_feed_type)]
    pub feed_type: FeedType,
    #[arg(value_name = "ID")]
    pub id: i64,
}

impl FeedRef {
    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.feed_type, self.id)
    }
}

/// Draft settings given on the command line. Unset flags leave the draft
/// as it is.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct FeedFlags {
    /// Include thumbnails
    #[arg(long, conflicts_with = "no_thumb")]
    pub thumb: bool,
    /// Leave thumbnails out
    #[arg(long)]
    pub no_thumb: bool,
    /// Include videos
    #[arg(long, conflicts_with = "no_video")]
    pub video: bool,
    /// Leave videos out
    #[arg(long)]
    pub no_video: bool,
    /// Include the summary
    #[arg(long)]
    pub summary: bool,
    /// Link posts to the article, not the entry
    #[arg(long)]
    pub linked_list: bool,
    /// Schedule period in minutes (1, 5, 15, 30 or 60)
    #[arg(long, value_name = "MINUTES", value_parser = parse_period)]
    pub period: Option<u32>,
    /// Stories per period
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max: Option<u32>,
    /// 1: linked title, 2: title then link
    #[arg(long, value_name = "MODE", value_parser = parse_format)]
    pub format: Option<FormatMode>,
}

impl FeedFlags {
    pub fn apply(&self, feed: &mut Feed) {
        if self.thumb || self.no_thumb {
            feed.include_thumb = self.thumb;
        }
        if self.video || self.no_video {
            feed.include_video = self.video;
        }
        if self.summary {
            feed.include_summary = true;
        }
        if self.linked_list {
            feed.linked_list_mode = true;
        }
        if let Some(value) = self.period {
            feed.schedule_period = value;
        }
        if let Some(value) = self.max {
            feed.max_stories_per_period = value;
        }
        if let Some(value) = self.format {
            feed.format_mode = value;
        }
    }
}

/// Feed types are accepted by name or by code.
fn parse_feed_type(s: &str) -> Result<FeedType, String> {
    match s.to_ascii_lowercase().as_str() {
        "rss" => Ok(FeedType::Rss),
        "instagram" => Ok(FeedType::Instagram),
        "broadcast" => Ok(FeedType::Broadcast),
        code => {
            let code: u8 = code
                .parse()
                .map_err(|_| format!("unknown feed type '{s}'"))?;
            FeedType::try_from(code)
        }
    }
}

fn parse_period(s: &str) -> Result<u32, String> {
    let minutes: u32 = s
        .parse()
        .map_err(|_| format!("expected minutes, got '{s}'"))?;
    if !SCHEDULE_PERIODS.contains(&minutes) {
        return Err(format!("period must be one of {:?}", SCHEDULE_PERIODS));
    }
    Ok(minutes)
}

fn parse_format(s: &str) -> Result<FormatMode, String> {
    let code: u8 = s
        .parse()
        .map_err(|_| format!("unknown format mode '{s}'"))?;
    FormatMode::try_from(code)
}

/// Open the session store and run one command against the configured
/// servers.
pub fn run(cli: Cli, cfg: &Config) -> Result<()> {
    let store = storage::Store::open(storage::Options {
        path: cfg.storage.path.clone(),
    })
    .context("open storage")?;
    let session = Arc::new(session::Manager::new(Arc::new(store)).context("restore session")?);
    let services = Services::connect(cfg, session.clone())?;
    let mut app = App::new(services, Options::from_config(cfg)).with_session(session);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    execute(&mut app, cli.command, &mut out)
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })
    .context("load config")
}

pub fn execute(app: &mut App, command: Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Login { redirect_url } => {
            let user = app.login(&redirect_url)?;
            writeln!(out, "Logged in as {} (@{})", user.display_name(), user.username)?;
            if let Err(err) = app.verify_scopes() {
                writeln!(out, "warning: {err:#}")?;
            }
            if let Some(path) = app.take_next_path() {
                writeln!(out, "Resume at {path}")?;
            }
        }
        Command::Logout => {
            app.logout()?;
            writeln!(out, "Logged out")?;
        }
        Command::Whoami => {
            let user = app.whoami()?;
            writeln!(out, "{} (@{}) id {}", user.display_name(), user.username, user.id)?;
        }
        Command::Feeds => {
            app.start();
            settle(app)?;
            for feed in app.state().feeds.feeds() {
                print_feed_line(out, feed)?;
            }
        }
        Command::Show { feed } => {
            select(app, feed.key())?;
            check_notice(app)?;
            let current = app.current().clone();
            print_feed(out, &current)?;
            if let Some(sets) = app.state().entries.as_ref() {
                print_entries(out, "Unpublished", &sets.unpublished)?;
                print_entries(out, "Overflow", &sets.overflow)?;
                print_entries(out, "Published", &sets.published)?;
            }
        }
        Command::Preview { url, flags } => {
            app.new_feed();
            app.edit_draft(Instant::now(), |draft| {
                draft.feed_url = url;
                flags.apply(draft);
            });
            settle(app)?;
            let preview = &app.state().preview;
            if let Some(message) = preview.error.as_ref().or(preview.failure.as_ref()) {
                bail!("{message}");
            }
            for post in preview.posts.iter().flatten() {
                writeln!(out, "{}", serde_json::to_string_pretty(post)?)?;
            }
        }
        Command::Create { url, flags } => {
            app.new_feed();
            app.edit_draft(Instant::now(), |draft| {
                draft.feed_url = url;
                flags.apply(draft);
            });
            let key = app.save_current()?;
            writeln!(out, "Created feed {key}")?;
        }
        Command::Update { feed, flags } => {
            select(app, feed.key())?;
            app.edit_draft(Instant::now(), |draft| flags.apply(draft));
            let key = app.save_current()?;
            writeln!(out, "Updated feed {key}")?;
        }
        Command::Delete { feed } => {
            let key = feed.key();
            select(app, key)?;
            app.delete_feed(key)?;
            writeln!(out, "Deleted feed {key}")?;
        }
        Command::Publish { feed, entry_id } => {
            select(app, feed.key())?;
            app.publish_entry(&entry_id)?;
            writeln!(out, "Published entry {entry_id}")?;
        }
        Command::Channels => {
            app.refresh_channels();
            settle(app)?;
            writeln!(out, "Subscribed:")?;
            for channel in app.state().channels.subscribed() {
                print_channel_line(out, channel)?;
            }
            writeln!(out, "Writable:")?;
            for channel in app.state().channels.writable() {
                print_channel_line(out, channel)?;
            }
        }
        Command::Channel { id } => {
            let channel = app.channel(&id)?;
            print_channel_line(out, &channel)?;
            if let Some(url) = channel.metadata().fallback_url {
                writeln!(out, "  {url}")?;
            }
            for message in app.messages(&id)? {
                print_message(out, &message)?;
            }
        }
        Command::Send { id, text } => {
            let message = app.send_message(&id, &text)?;
            writeln!(out, "Sent message {}", message.id)?;
        }
        Command::CreateChannel { title, description } => {
            let channel = app.create_channel(&NewChannel::new(title, description))?;
            writeln!(out, "Created channel {}", channel.id)?;
        }
        Command::Subscribe { id } => {
            app.subscribe(&id)?;
            writeln!(out, "Subscribed to {id}")?;
        }
        Command::Unsubscribe { id } => {
            app.unsubscribe(&id)?;
            writeln!(out, "Unsubscribed from {id}")?;
        }
    }
    Ok(())
}

// Only the list outcome decides a selection; preview and entries results
// for the selected feed are judged by the commands that show them.
fn select(app: &mut App, key: FeedKey) -> Result<()> {
    app.select_feed(key);
    wait(app)?;
    if app.current().key() == Some(key) {
        return Ok(());
    }
    check_notice(app)?;
    bail!("feed {key} not found")
}

fn settle(app: &mut App) -> Result<()> {
    wait(app)?;
    check_notice(app)
}

fn wait(app: &mut App) -> Result<()> {
    if !app.settle(SETTLE_TIMEOUT) {
        bail!("timed out waiting for the server");
    }
    Ok(())
}

/// Turn an error notice from the background requests into a failure.
fn check_notice(app: &mut App) -> Result<()> {
    match app.take_notice() {
        Some(notice) if notice.level == NoticeLevel::Error => {
            if app.state().needs_login {
                Err(anyhow!(
                    "{}; run `pourover login <redirect-url>`",
                    notice.message
                ))
            } else {
                Err(anyhow!("{}", notice.message))
            }
        }
        _ => Ok(()),
    }
}

fn print_feed_line(out: &mut dyn Write, feed: &Feed) -> io::Result<()> {
    let key = feed
        .key()
        .map(|key| key.to_string())
        .unwrap_or_else(|| "-".into());
    writeln!(out, "{key}\t{}\t{}", feed.display_title(), feed.feed_url)
}

fn print_feed(out: &mut dyn Write, feed: &Feed) -> io::Result<()> {
    print_feed_line(out, feed)?;
    writeln!(out, "  type: {}", feed.feed_type.display_name())?;
    writeln!(
        out,
        "  schedule: {} per {} min",
        feed.max_stories_per_period, feed.schedule_period
    )?;
    writeln!(
        out,
        "  thumb: {}, video: {}, summary: {}, linked list: {}",
        feed.include_thumb, feed.include_video, feed.include_summary, feed.linked_list_mode
    )
}

fn print_entries(out: &mut dyn Write, heading: &str, entries: &[Entry]) -> io::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(out, "{heading}:")?;
    for entry in entries {
        writeln!(
            out,
            "  {}\t{}\t{}\t[{}]",
            entry.id,
            entry.title.as_deref().unwrap_or("(untitled)"),
            entry.status_label(),
            entry.action_label()
        )?;
    }
    Ok(())
}

fn print_channel_line(out: &mut dyn Write, channel: &Channel) -> io::Result<()> {
    let meta = channel.metadata();
    let mut marks = String::new();
    if channel.you_subscribed {
        marks.push('s');
    }
    if channel.you_can_edit {
        marks.push('w');
    }
    writeln!(out, "{}\t{}\t{marks}", channel.id, meta.title)
}

fn print_message(out: &mut dyn Write, message: &Message) -> io::Result<()> {
    let thumbnail = message.oembed().and_then(|embed| embed.thumbnail);
    match thumbnail {
        Some((width, height)) => writeln!(
            out,
            "  {}\t{}\t[thumbnail {width}x{height}]",
            message.id, message.text
        ),
        None => writeln!(out, "  {}\t{}", message.id, message.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryService, PreviewScript};
    use crate::models::{User, OEMBED_ANNOTATION};
    use crate::storage::Store;
    use clap::error::ErrorKind;
    use serde_json::json;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("pourover").chain(line.split_whitespace()))
    }

    fn command(line: &str) -> Command {
        parse(line).unwrap().command
    }

    fn app(service: &MemoryService) -> App {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = Arc::new(session::Manager::new(store).unwrap());
        App::new(
            Services::memory(service.clone()),
            Options {
                debounce: Duration::from_millis(10),
                site_root: "http://site".into(),
            },
        )
        .with_session(session)
    }

    fn run_line(app: &mut App, line: &str) -> Result<String> {
        let mut out = Vec::new();
        execute(app, command(line), &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    fn broadcast(id: &str) -> Channel {
        serde_json::from_value(json!({
            "id": id,
            "type": crate::models::BROADCAST_CHANNEL_TYPE,
            "you_can_edit": true,
            "annotations": [{
                "type": crate::models::BROADCAST_METADATA_ANNOTATION,
                "value": {"title": "Alerts", "description": "Service alerts"}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_global_flags() {
        assert_eq!(
            parse("--version").unwrap_err().kind(),
            ErrorKind::DisplayVersion
        );
        assert_eq!(
            parse("").unwrap_err().kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
        assert_eq!(parse("feeds --help").unwrap_err().kind(), ErrorKind::DisplayHelp);

        let cli = parse("--config /tmp/c.yaml feeds").unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert_eq!(cli.command, Command::Feeds);

        let cli = parse("feeds --config /tmp/d.yaml").unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.yaml")));
    }

    #[test]
    fn test_feed_flags() {
        let parsed =
            command("create http://x/rss --no-thumb --summary --period 15 --max 3 --format 2");
        assert_eq!(
            parsed,
            Command::Create {
                url: "http://x/rss".into(),
                flags: FeedFlags {
                    no_thumb: true,
                    summary: true,
                    period: Some(15),
                    max: Some(3),
                    format: Some(FormatMode::TitleThenLink),
                    ..FeedFlags::default()
                },
            }
        );

        let mut feed = Feed {
            include_thumb: true,
            include_video: true,
            ..Feed::with_url("http://x/rss")
        };
        if let Command::Create { flags, .. } = parsed {
            flags.apply(&mut feed);
        }
        assert!(!feed.include_thumb);
        assert!(feed.include_video);
        assert!(feed.include_summary);
        assert_eq!(feed.schedule_period, 15);
    }

    #[test]
    fn test_bad_arguments() {
        let err = |line: &str| parse(line).unwrap_err().kind();
        assert_eq!(err("create"), ErrorKind::MissingRequiredArgument);
        assert_eq!(err("feeds --summary"), ErrorKind::UnknownArgument);
        assert_eq!(err("create http://x/ --period 7"), ErrorKind::ValueValidation);
        assert_eq!(err("create http://x/ --format 3"), ErrorKind::ValueValidation);
        assert_eq!(err("create http://x/ --max 0"), ErrorKind::ValueValidation);
        assert_eq!(err("create http://x/ --thumb --no-thumb"), ErrorKind::ArgumentConflict);
        assert_eq!(err("show rss abc"), ErrorKind::ValueValidation);
        assert_eq!(err("frobnicate"), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_feed_type_names_and_codes() {
        assert_eq!(
            command("show rss 4"),
            Command::Show {
                feed: FeedRef {
                    feed_type: FeedType::Rss,
                    id: 4
                }
            }
        );
        match command("delete 2 9") {
            Command::Delete { feed } => {
                assert_eq!(feed.key(), FeedKey::new(FeedType::Instagram, 9))
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(parse_feed_type("7").is_err());
        assert!(parse_feed_type("atom").is_err());
    }

    #[test]
    fn create_then_list_feeds() {
        let service = MemoryService::new();
        let mut app = app(&service);
        let output = run_line(&mut app, "create http://example.com/rss --summary").unwrap();
        assert_eq!(output.trim(), "Created feed 1/1");
        assert!(service.feeds()[0].include_summary);

        let output = run_line(&mut app, "feeds").unwrap();
        assert!(output.contains("1/1\t"));
        assert!(output.contains("http://example.com/rss"));
    }

    #[test]
    fn show_lists_partitioned_entries() {
        let service = MemoryService::with_feeds(vec![Feed::with_url("http://a/")]);
        let key = FeedKey::new(FeedType::Rss, 1);
        service.set_entries(
            key,
            vec![
                serde_json::from_value(json!({"id": "e1", "title": "One", "published": true})).unwrap(),
                serde_json::from_value(json!({"id": "e2", "title": "Two", "overflow_reason": "Feed backed up"})).unwrap(),
            ],
        );
        let mut app = app(&service);
        let output = run_line(&mut app, "show rss 1").unwrap();
        assert!(output.contains("Published:"));
        assert!(output.contains("Feed backed up\t[Try Publishing Now]"));
        assert!(output.contains("One\tPublished\t[Republish Now]"));
    }

    #[test]
    fn show_unknown_feed_fails() {
        let service = MemoryService::with_feeds(vec![Feed::with_url("http://a/")]);
        let mut app = app(&service);
        let err = run_line(&mut app, "show rss 5").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn delete_succeeds_while_preview_is_rejected() {
        let service = MemoryService::with_feeds(vec![Feed::with_url("http://a/")]);
        service.set_preview(PreviewScript::Rejected("Not a feed".into()));
        let mut app = app(&service);
        let output = run_line(&mut app, "delete rss 1").unwrap();
        assert_eq!(output.trim(), "Deleted feed 1/1");
        assert!(service.feeds().is_empty());
    }

    #[test]
    fn update_succeeds_while_preview_is_unreachable() {
        let service = MemoryService::with_feeds(vec![Feed::with_url("http://a/")]);
        service.set_preview(PreviewScript::Unreachable);
        let mut app = app(&service);
        let output = run_line(&mut app, "update rss 1 --summary").unwrap();
        assert_eq!(output.trim(), "Updated feed 1/1");
        assert!(service.feeds()[0].include_summary);
    }

    #[test]
    fn preview_prints_posts_and_surfaces_rejection() {
        let service = MemoryService::new();
        let mut app = app(&service);
        let output = run_line(&mut app, "preview http://example.com/rss").unwrap();
        assert!(output.contains("http://example.com/rss"));

        service.set_preview(PreviewScript::Rejected("Not a feed".into()));
        let err = run_line(&mut app, "preview http://other/").unwrap_err();
        assert!(err.to_string().contains("Not a feed"));
    }

    #[test]
    fn preview_surfaces_transport_failure() {
        let service = MemoryService::new();
        service.set_preview(PreviewScript::Unreachable);
        let mut app = app(&service);
        assert!(run_line(&mut app, "preview http://example.com/rss").is_err());
    }

    #[test]
    fn channel_prints_messages_with_scaled_thumbnails() {
        let service = MemoryService::new();
        service.insert_channel(broadcast("7"));
        service.insert_message(
            "7",
            serde_json::from_value(json!({
                "id": "m1",
                "text": "With picture",
                "annotations": [{"type": OEMBED_ANNOTATION, "value": {
                    "thumbnail_url": "http://img/1.png",
                    "thumbnail_width": 400,
                    "thumbnail_height": 200
                }}]
            }))
            .unwrap(),
        );
        service.insert_message(
            "7",
            serde_json::from_value(json!({"id": "m2", "text": "Plain"})).unwrap(),
        );
        let mut app = app(&service);
        let output = run_line(&mut app, "channel 7").unwrap();
        assert!(output.starts_with("7\tAlerts\tw"));
        assert!(output.contains("  m1\tWith picture\t[thumbnail 100x50]"));
        assert!(output.contains("  m2\tPlain\n"));
    }

    #[test]
    fn send_posts_message_to_channel() {
        let service = MemoryService::new();
        service.insert_channel(broadcast("7"));
        let mut app = app(&service);
        let output = run_line(&mut app, "send 7 hello").unwrap();
        assert_eq!(output.trim(), "Sent message 7-1");

        let output = run_line(&mut app, "channel 7").unwrap();
        assert!(output.contains("  7-1\thello"));

        let err = run_line(&mut app, "send 8 hello").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn login_then_whoami() {
        let service = MemoryService::new();
        service.set_user(User {
            id: "5".into(),
            username: "bob".into(),
            name: Some("Bob".into()),
            ..User::default()
        });
        let mut app = app(&service);
        let output = run_line(&mut app, "login http://site/#access_token=abc").unwrap();
        assert!(output.starts_with("Logged in as Bob (@bob)"));
        assert!(!output.contains("warning"));
        let output = run_line(&mut app, "whoami").unwrap();
        assert_eq!(output.trim(), "Bob (@bob) id 5");
        run_line(&mut app, "logout").unwrap();
        assert!(run_line(&mut app, "whoami").is_err());
    }

    #[test]
    fn login_reports_remembered_path() {
        let service = MemoryService::new();
        service.set_user(User {
            id: "5".into(),
            username: "bob".into(),
            ..User::default()
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.save_token("old").unwrap();
        store.set_next_path(Some("/feeds/1/1/")).unwrap();
        let session = Arc::new(session::Manager::new(store).unwrap());
        let mut app = App::new(Services::memory(service.clone()), Options::default())
            .with_session(session);

        let output = run_line(&mut app, "login http://site/#access_token=abc").unwrap();
        assert!(output.contains("Resume at /feeds/1/1/"));
        let output = run_line(&mut app, "login http://site/#access_token=abc").unwrap();
        assert!(!output.contains("Resume at"));
    }
}
