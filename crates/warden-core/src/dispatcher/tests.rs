use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::*;
use crate::{
    automod::AutoModerator,
    domain::UserId,
    persistence::{MemoryStore, Persistence, PersistenceSettings},
    testing::{message, FakeChat},
};

struct Echo {
    descriptor: CommandDescriptor,
    generation: u32,
    fail: bool,
}

#[async_trait]
impl Command for Echo {
    fn descriptor(&self) -> CommandDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        if self.fail {
            return Err(Error::Transient("backend down".into()));
        }
        if ctx.args.is_empty() {
            return Err(Error::validation("nothing to echo"));
        }
        ctx.reply(&format!("{}:{}", self.generation, ctx.args.join(" ")))
            .await?;
        Ok(())
    }
}

fn echo(descriptor: CommandDescriptor) -> CommandFactory {
    let builds = Arc::new(AtomicU32::new(0));
    factory(move || {
        let generation = builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(Echo {
            descriptor: descriptor.clone(),
            generation,
            fail: false,
        }) as Arc<dyn Command>)
    })
}

fn failing(name: &str) -> CommandFactory {
    let descriptor = CommandDescriptor::new(name);
    factory(move || {
        Ok(Arc::new(Echo {
            descriptor: descriptor.clone(),
            generation: 0,
            fail: true,
        }) as Arc<dyn Command>)
    })
}

struct Broken;

#[async_trait]
impl CommandCategory for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn entries(&self) -> Result<Vec<CommandFactory>> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such category",
        )))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    services: Services,
    chat: Arc<FakeChat>,
}

async fn harness() -> Harness {
    let chat = Arc::new(FakeChat::default());
    let persistence = Persistence::new(Arc::new(MemoryStore::new()), PersistenceSettings::default());
    let automod = AutoModerator::new(persistence.clone(), chat.clone(), Duration::from_secs(600))
        .unwrap();
    let services = Services {
        persistence,
        chat: chat.clone(),
        automod,
        owners: vec![UserId(100)],
    };

    let manifest: Manifest = vec![
        Arc::new(StaticCategory::new(
            "general",
            vec![
                echo(
                    CommandDescriptor::new("echo")
                        .aliases(["say", "repeat"])
                        .usage("echo <text>")
                        .rate_limit(2, Duration::from_secs(5)),
                ),
                failing("explode"),
            ],
        )),
        Arc::new(StaticCategory::new(
            "admin",
            vec![
                echo(CommandDescriptor::new("shutdown").flags(CommandFlags {
                    owner_only: true,
                    ..CommandFlags::default()
                })),
                echo(CommandDescriptor::new("purge").flags(CommandFlags {
                    admin_only: true,
                    server_only: true,
                    hidden: true,
                    ..CommandFlags::default()
                })),
            ],
        )),
    ];

    let dispatcher = Dispatcher::new(Duration::from_secs(30));
    dispatcher.load(&manifest).await.unwrap();
    Harness {
        dispatcher,
        services,
        chat,
    }
}

impl Harness {
    async fn run(&self, user: i64, content: &str) -> Result<Outcome> {
        self.dispatcher
            .execute(
                &message(1, 1, user, content),
                "!",
                &ServerConfig::default(),
                &self.services,
            )
            .await
    }
}

#[tokio::test]
async fn load_counts_invalid_entries_without_failing() {
    let dispatcher = Dispatcher::new(Duration::from_secs(30));
    let manifest: Manifest = vec![
        Arc::new(StaticCategory::new(
            "a",
            vec![
                echo(CommandDescriptor::new("ping").aliases(["p"])),
                echo(CommandDescriptor::new("")),
                echo(CommandDescriptor::new("Bad Name")),
                echo(CommandDescriptor::new("zero").rate_limit(0, Duration::from_secs(1))),
                factory(|| Err(Error::validation("factory refused"))),
            ],
        )),
        Arc::new(StaticCategory::new(
            "b",
            vec![
                echo(CommandDescriptor::new("pong").aliases(["ping"])),
                echo(CommandDescriptor::new("p")),
                echo(CommandDescriptor::new("stats")),
            ],
        )),
    ];

    let report = dispatcher.load(&manifest).await.unwrap();
    assert_eq!(report.loaded, 2);
    assert_eq!(report.skipped, 6);
    assert_eq!(report.categories.len(), 2);
    assert_eq!(report.categories[0].category, "a");
    assert_eq!(report.categories[0].loaded, 1);
    assert_eq!(report.categories[0].skipped, 4);
    assert_eq!(report.categories[1].loaded, 1);
    assert_eq!(report.categories[1].skipped, 2);
    assert_eq!(dispatcher.len(), 2);
    assert_eq!(dispatcher.stats(), report);
}

#[tokio::test]
async fn unreadable_category_fails_the_load() {
    let dispatcher = Dispatcher::new(Duration::from_secs(30));
    let manifest: Manifest = vec![
        Arc::new(StaticCategory::new("ok", vec![echo(CommandDescriptor::new("ping"))])),
        Arc::new(Broken),
    ];
    assert!(matches!(dispatcher.load(&manifest).await, Err(Error::Io(_))));
    assert!(dispatcher.is_empty());
    assert!(dispatcher.resolve("ping").is_none());
    assert_eq!(dispatcher.stats(), LoadReport::default());
}

#[tokio::test]
async fn resolves_names_and_aliases_case_insensitively() {
    let h = harness().await;
    for key in ["echo", "ECHO", "say", "Repeat"] {
        let (_, d) = h.dispatcher.resolve(key).unwrap();
        assert_eq!(d.name, "echo");
        assert_eq!(d.category, "general");
    }
    assert!(h.dispatcher.resolve("nope").is_none());
}

#[tokio::test]
async fn execute_parses_prefix_and_arguments() {
    let h = harness().await;
    assert_eq!(h.run(1, "hello there").await.unwrap(), Outcome::NotACommand);
    assert_eq!(h.run(1, "!").await.unwrap(), Outcome::NotACommand);
    assert_eq!(h.run(1, "! echo hi").await.unwrap(), Outcome::NotACommand);
    assert_eq!(
        h.run(1, "!dance").await.unwrap(),
        Outcome::Unknown {
            name: "dance".into()
        }
    );
    assert_eq!(
        h.run(1, "!SAY  hello   world").await.unwrap(),
        Outcome::Executed {
            command: "echo".into()
        }
    );
    assert_eq!(h.chat.sent_texts(), vec!["1:hello world".to_string()]);
    assert_eq!(h.dispatcher.executions("echo"), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_rejects_until_window_passes() {
    let h = harness().await;
    for _ in 0..2 {
        assert!(matches!(h.run(1, "!echo x").await.unwrap(), Outcome::Executed { .. }));
    }
    match h.run(1, "!say x").await.unwrap() {
        Outcome::RateLimited { command, remaining } => {
            assert_eq!(command, "echo");
            assert_eq!(remaining, Duration::from_secs(5));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    // Other users have their own window.
    assert!(matches!(h.run(2, "!echo x").await.unwrap(), Outcome::Executed { .. }));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(matches!(h.run(1, "!echo x").await.unwrap(), Outcome::Executed { .. }));
    let state = h.dispatcher.limiter().state(UserId(1), "echo").unwrap();
    assert_eq!(state.usage, 1);
}

#[tokio::test]
async fn flags_gate_execution() {
    let h = harness().await;
    assert_eq!(
        h.run(1, "!shutdown").await.unwrap(),
        Outcome::Forbidden {
            command: "shutdown".into(),
            reason: Forbidden::OwnerOnly
        }
    );
    assert!(matches!(h.run(100, "!shutdown now").await.unwrap(), Outcome::Executed { .. }));
    assert!(matches!(
        h.run(1, "!purge 10").await.unwrap(),
        Outcome::Forbidden { reason: Forbidden::AdminOnly, .. }
    ));

    let mut dm = message(1, 1, 100, "!purge 10");
    dm.server_id = None;
    let out = h
        .dispatcher
        .execute(&dm, "!", &ServerConfig::default(), &h.services)
        .await
        .unwrap();
    assert!(matches!(out, Outcome::Forbidden { reason: Forbidden::ServerOnly, .. }));

    let mut cfg = ServerConfig::default();
    cfg.security.disabled_commands.push("echo".into());
    let out = h
        .dispatcher
        .execute(&message(1, 1, 1, "!say hi"), "!", &cfg, &h.services)
        .await
        .unwrap();
    assert!(matches!(out, Outcome::Forbidden { reason: Forbidden::Disabled, .. }));
}

#[tokio::test]
async fn body_errors_are_re_raised() {
    let h = harness().await;
    assert!(matches!(h.run(1, "!explode").await, Err(Error::Transient(_))));
    assert!(matches!(h.run(1, "!echo").await, Err(Error::Validation(_))));
}

#[tokio::test]
async fn reload_swaps_in_a_fresh_instance() {
    let h = harness().await;
    h.run(1, "!echo a").await.unwrap();

    let d = h.dispatcher.reload("SAY").unwrap();
    assert_eq!(d.name, "echo");
    assert_eq!(d.category, "general");

    h.run(2, "!repeat b").await.unwrap();
    assert_eq!(
        h.chat.sent_texts(),
        vec!["1:a".to_string(), "2:b".to_string()]
    );
    assert_eq!(h.dispatcher.executions("echo"), 2);
    assert!(matches!(h.dispatcher.reload("missing"), Err(Error::Validation(_))));
}

#[tokio::test]
async fn failed_reload_keeps_the_previous_command() {
    let dispatcher = Dispatcher::new(Duration::from_secs(30));
    let builds = Arc::new(AtomicU32::new(0));
    let counter = builds.clone();
    let manifest: Manifest = vec![Arc::new(StaticCategory::new(
        "flaky",
        vec![factory(move || {
            if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::validation("definition broke"));
            }
            Ok(Arc::new(Echo {
                descriptor: CommandDescriptor::new("flaky").aliases(["fl"]),
                generation: 1,
                fail: false,
            }) as Arc<dyn Command>)
        })],
    ))];
    dispatcher.load(&manifest).await.unwrap();

    assert!(dispatcher.reload("flaky").is_err());
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert!(dispatcher.resolve("fl").is_some());
}

#[tokio::test]
async fn listing_hides_hidden_commands() {
    let h = harness().await;
    let names: Vec<String> = h.dispatcher.commands().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["shutdown", "echo", "explode"]);
}
