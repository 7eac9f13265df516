//! `punch` - CLI for punchclock
//!
//! Records check-ins and check-outs, shows presence, and manages site
//! emergencies against the local attendance database.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use punchclock::cli::{
    AuditCommand, CheckOutCommand, Cli, Command, ConfigCommand, DemoCommand, EmergencyCommand,
    HistoryCommand, SiteCommand, StatusCommand, WorkerCommand,
};
use punchclock::sync::{ObserverHandle, ReconciliationClient, Scope, ViewSnapshot};
use punchclock::{
    init_logging, Attendance, CheckEvent, Config, EventFilter, Site, SiteId, WorkerId,
    WorkerStatus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
        Command::Demo(demo_cmd) => handle_demo(&config, &demo_cmd).await,
        command => {
            let service = Attendance::open(&config).with_context(|| {
                format!("failed to open {}", config.database_path().display())
            })?;
            dispatch(&service, command).await
        }
    }
}

async fn dispatch(service: &Attendance, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Worker(cmd) => handle_worker(service, cmd).await,
        Command::Site(cmd) => handle_site(service, cmd).await,
        Command::CheckIn(cmd) => {
            let event = service
                .check_in(WorkerId::new(cmd.worker), SiteId::new(cmd.site))
                .await?;
            print_event_receipt(service, &event).await
        }
        Command::CheckOut(cmd) => handle_check_out(service, &cmd).await,
        Command::Emergency(cmd) => handle_emergency(service, &cmd).await,
        Command::Status(cmd) => handle_status(service, &cmd).await,
        Command::History(cmd) => handle_history(service, &cmd).await,
        Command::Audit(cmd) => handle_audit(service, &cmd).await,
        Command::Config(_) | Command::Demo(_) => Ok(()),
    }
}

async fn handle_worker(service: &Attendance, cmd: WorkerCommand) -> anyhow::Result<()> {
    match cmd {
        WorkerCommand::Add { name } => {
            let worker = service.add_worker(&name).await?;
            println!("Registered worker {} ({})", worker.id, worker.name);
        }
        WorkerCommand::List { json } => {
            let workers = service.workers().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workers)?);
            } else {
                println!("{:>6}  NAME", "ID");
                for worker in workers {
                    println!("{:>6}  {}", worker.id, worker.name);
                }
            }
        }
    }
    Ok(())
}

async fn handle_site(service: &Attendance, cmd: SiteCommand) -> anyhow::Result<()> {
    match cmd {
        SiteCommand::Add { name } => {
            let site = service.add_site(&name).await?;
            println!("Registered site {} ({})", site.id, site.name);
        }
        SiteCommand::List { json } => {
            let sites = service.sites().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sites)?);
            } else {
                println!("{:>6}  {:<24}  EMERGENCY", "ID", "NAME");
                for site in sites {
                    println!(
                        "{:>6}  {:<24}  {}",
                        site.id,
                        site.name,
                        if site.emergency { "ACTIVE" } else { "-" }
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_check_out(service: &Attendance, cmd: &CheckOutCommand) -> anyhow::Result<()> {
    let worker = WorkerId::new(cmd.worker);
    let site = match cmd.site {
        Some(site) => SiteId::new(site),
        None => match service
            .worker_status(worker)
            .await?
            .and_then(|status| status.state.site_id)
        {
            Some(site) => site,
            None => bail!("worker {worker} is not checked in; pass a site to record the check-out"),
        },
    };

    let event = service.check_out(worker, site).await?;
    print_event_receipt(service, &event).await
}

async fn print_event_receipt(service: &Attendance, event: &CheckEvent) -> anyhow::Result<()> {
    let site = service.site(event.site_id).await?;
    println!(
        "Recorded {} for worker {} at {} ({})",
        event.kind,
        event.worker_id,
        site.name,
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

async fn handle_emergency(service: &Attendance, cmd: &EmergencyCommand) -> anyhow::Result<()> {
    let active = cmd.switch.is_on();
    let label = if active { "declared" } else { "lifted" };

    if cmd.all {
        let mut failures = 0;
        for (site, outcome) in service.set_emergency_all(active).await? {
            match outcome {
                Ok(site) => println!("Emergency {label} at {} ({})", site.name, site.id),
                Err(err) => {
                    failures += 1;
                    eprintln!("Site {site}: {err}");
                }
            }
        }
        if failures > 0 {
            bail!("{failures} site(s) could not be updated");
        }
        return Ok(());
    }

    let Some(site) = cmd.site else {
        bail!("a site is required unless --all is given");
    };
    let site = service.set_emergency(SiteId::new(site), active).await?;
    println!("Emergency {label} at {} ({})", site.name, site.id);
    Ok(())
}

async fn handle_status(service: &Attendance, cmd: &StatusCommand) -> anyhow::Result<()> {
    let (present, sites): (Vec<WorkerStatus>, Vec<Site>) = match cmd.site {
        Some(site) => {
            let site = SiteId::new(site);
            (
                service.checked_in_at(site).await?,
                vec![service.site(site).await?],
            )
        }
        None => (
            service
                .worker_statuses()
                .await?
                .into_iter()
                .filter(|status| status.state.is_checked_in)
                .collect(),
            service.sites().await?,
        ),
    };

    if cmd.json {
        let status = serde_json::json!({
            "checked_in": present.len(),
            "emergency_active": sites.iter().any(|site| site.emergency),
            "sites": sites,
            "workers": present,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("punch status");
    println!("------------");
    for site in &sites {
        let here = present
            .iter()
            .filter(|status| status.is_present_at(site.id))
            .count();
        let flag = if site.emergency { "  [EMERGENCY]" } else { "" };
        println!("{:<24} {here:>4} on site{flag}", site.name);
    }
    println!();

    if present.is_empty() {
        println!("Nobody is checked in.");
        return Ok(());
    }
    println!("{:>6}  {:<20}  {:<20}  SINCE", "ID", "WORKER", "SITE");
    for status in &present {
        println!(
            "{:>6}  {:<20}  {:<20}  {}",
            status.worker_id(),
            status.worker_name,
            status.site_name.as_deref().unwrap_or("-"),
            status
                .state
                .last_check_in
                .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_history(service: &Attendance, cmd: &HistoryCommand) -> anyhow::Result<()> {
    let filter = EventFilter {
        site_id: cmd.site.map(SiteId::new),
        worker_id: cmd.worker.map(WorkerId::new),
        since: cmd.since,
        until: cmd.until,
        limit: Some(cmd.limit),
    };
    let events = service.history(&filter).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No events.");
        return Ok(());
    }

    let workers: HashMap<WorkerId, String> = service
        .workers()
        .await?
        .into_iter()
        .map(|w| (w.id, w.name))
        .collect();
    let sites: HashMap<SiteId, String> = service
        .sites()
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    println!("{:<19}  {:<9}  {:<20}  SITE", "TIME (UTC)", "EVENT", "WORKER");
    for event in events {
        println!(
            "{:<19}  {:<9}  {:<20}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind.to_string(),
            workers.get(&event.worker_id).map_or("?", String::as_str),
            sites.get(&event.site_id).map_or("?", String::as_str),
        );
    }
    Ok(())
}

async fn handle_audit(service: &Attendance, cmd: &AuditCommand) -> anyhow::Result<()> {
    let divergent = if cmd.repair {
        service.projector().repair().await?
    } else {
        service.projector().audit().await?
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&divergent)?);
    } else if divergent.is_empty() {
        println!("Worker states match the ledger.");
    } else {
        let verb = if cmd.repair { "Repaired" } else { "Found" };
        println!("{verb} {} divergent worker state(s):", divergent.len());
        for divergence in &divergent {
            println!(
                "  worker {}: stored {}, ledger says {}",
                divergence.worker_id,
                describe_presence(divergence.stored.as_ref().and_then(|s| s.site_id)),
                describe_presence(divergence.replayed.as_ref().and_then(|s| s.site_id)),
            );
        }
    }

    if !cmd.repair && !divergent.is_empty() {
        bail!("projection diverges from ledger; run with --repair to fix");
    }
    Ok(())
}

fn describe_presence(site: Option<SiteId>) -> String {
    site.map_or_else(|| "absent".to_string(), |site| format!("at site {site}"))
}

async fn handle_demo(config: &Config, cmd: &DemoCommand) -> anyhow::Result<()> {
    let service = Attendance::in_memory()?;
    let ada = service.add_worker("Ada").await?.id;
    let grace = service.add_worker("Grace").await?.id;
    let linus = service.add_worker("Linus").await?.id;
    let north = service.add_site("North Yard").await?.id;
    let south = service.add_site("South Dock").await?.id;

    let mut sync = config.sync.clone();
    sync.debounce_ms = cmd.debounce_ms.max(1);
    let pause = sync.debounce() * 3;

    let client = ReconciliationClient::new(Arc::new(service.clone()), &sync, Scope::All);
    let mut snapshots = client.watch();
    let shutdown = client.shutdown_token();
    let (handle, receiver) = ObserverHandle::channel(8);
    let observer = tokio::spawn(client.run(receiver));

    let json = cmd.json;
    let printer = tokio::spawn(async move {
        let mut last = None;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            let key = (snapshot.phase, snapshot.checked_in, snapshot.emergency_active);
            if last != Some(key) {
                last = Some(key);
                print_snapshot(&snapshot, json);
            }
        }
    });

    let step = |text: &str| println!("» {text}");
    tokio::time::sleep(pause).await;

    step("Ada checks in at North Yard from the observer");
    handle.check_in(ada, north).await?;
    tokio::time::sleep(pause).await;

    step("Grace checks in at South Dock");
    service.check_in(grace, south).await?;
    tokio::time::sleep(pause).await;

    step("Emergency declared at North Yard");
    service.set_emergency(north, true).await?;
    tokio::time::sleep(pause).await;

    step("Linus tries to check in at North Yard from the observer");
    if let Err(err) = handle.check_in(linus, north).await {
        println!("  refused and rolled back: {err}");
    }

    step("Ada leaves North Yard");
    service.check_out(ada, north).await?;
    tokio::time::sleep(pause).await;

    step("Notification server restarts");
    service.notifier().disconnect_all();
    tokio::time::sleep(pause).await;

    step("Emergency lifted; Grace leaves");
    service.set_emergency(north, false).await?;
    service.check_out(grace, south).await?;
    tokio::time::sleep(pause).await;

    step("Observer returns to the foreground");
    handle.foreground().await?;
    tokio::time::sleep(pause).await;

    shutdown.cancel();
    observer.await.context("observer task failed")?;
    printer.await.context("printer task failed")?;

    let audit = service.projector().audit().await?;
    println!(
        "Ledger holds {} events; {} divergent worker state(s).",
        service.stats().await?.events,
        audit.len()
    );
    Ok(())
}

fn print_snapshot(snapshot: &ViewSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("failed to encode snapshot: {err}"),
        }
        return;
    }

    let checked_in = snapshot
        .checked_in
        .map_or_else(|| "-".to_string(), |n| n.to_string());
    let emergency = match snapshot.emergency_active {
        Some(true) => "EMERGENCY",
        Some(false) => "clear",
        None => "-",
    };
    let stale = if snapshot.is_degraded() {
        "  (view may be out of date)"
    } else {
        ""
    };
    println!(
        "  [observer {}] on site: {checked_in}  status: {emergency}{stale}",
        snapshot.phase
    );
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Busy timeout:       {:?}", config.busy_timeout());
                println!();
                println!("[Notifier]");
                println!("  Channel capacity:   {}", config.notifier.channel_capacity);
                println!(
                    "  Announcements:      {}",
                    config.notifier.announcement_capacity
                );
                println!();
                println!("[Sync]");
                println!("  Call timeout:       {:?}", config.sync.call_timeout());
                println!("  Retry attempts:     {}", config.sync.retry_attempts);
                println!(
                    "  Backoff:            {:?} .. {:?}",
                    config.sync.initial_backoff(),
                    config.sync.max_backoff()
                );
                println!("  Debounce:           {:?}", config.sync.debounce());
                println!("  Reconnect attempts: {}", config.sync.reconnect_attempts);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
