// SPDX-License-Identifier: MIT

#[macro_use]
extern crate prettytable;

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use console::style;
use getopts::Options;
use prettytable::format;
use tracing::{error, info};

use catalog_sync::access;
use catalog_sync::catalog::{BundleRecord, CatalogWriter};
use catalog_sync::db::pg::PgStore;
use catalog_sync::debug;
use catalog_sync::gate::AvailabilityGate;
use catalog_sync::reconcile::StorageReconciler;
use catalog_sync::repository::RepositoryIndex;
use catalog_sync::settings::Settings;
use catalog_sync::store::{RepositoryRecord, Store, StoredComponent, StoredSystem};
use catalog_sync::sync::{SyncCoordinator, SyncEvent};
use catalog_sync::watcher::{resolve_mode, FileWatcher};

struct Parameters {
    config_file: String,
    debug: usize,
    once: bool,
    reset: bool,
    list_repositories: bool,
    list_systems: bool,
    system: Option<String>,
    list_bundles: bool,
    locate: Option<String>,
}

fn last(matches: &getopts::Matches, name: &str) -> Option<String> {
    matches.opt_strs(name).last().cloned()
}

fn setup_params() -> Parameters {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();
    let mut opts = Options::new();

    let mut params = Parameters {
        config_file: String::from("/etc/catalog-sync/catalog-sync.toml"),
        debug: 0,
        once: false,
        reset: false,
        list_repositories: false,
        list_systems: false,
        system: None,
        list_bundles: false,
        locate: None,
    };

    opts.optmulti(
        "c",
        "config",
        &format!("configuration file ({})", params.config_file),
        "CONFIG",
    );
    opts.optflagmulti("d", "debug", "enable debug, repeat for more");
    opts.optflagmulti("", "once", "scan and sync once, then exit");
    opts.optflagmulti(
        "",
        "reset",
        "remove all synchronized data and intermediate artifacts",
    );
    opts.optflagmulti("", "list-repositories", "list known repositories");
    opts.optflagmulti("", "list-systems", "list known systems");
    opts.optmulti("", "system", "list components for system SYSTEM", "SYSTEM");
    opts.optflagmulti("", "list-bundles", "list bundles of all repositories");
    opts.optmulti(
        "",
        "locate",
        "show and verify the payload of component ID",
        "ID",
    );
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) if !m.opt_present("help") => m,
        _ => {
            print!(
                "{}",
                opts.usage(format!("Usage: {} [options]", program).as_str())
            );
            process::exit(0);
        }
    };

    params.debug = matches.opt_count("debug");
    params.once = matches.opt_present("once");
    params.reset = matches.opt_present("reset");
    params.list_repositories = matches.opt_present("list-repositories");
    params.list_systems = matches.opt_present("list-systems");
    params.list_bundles = matches.opt_present("list-bundles");
    params.system = last(&matches, "system");
    params.locate = last(&matches, "locate");

    if let Some(c) = last(&matches, "config") {
        params.config_file = c;
    }

    params
}

fn fail(msg: String) -> ! {
    eprintln!("{} {}", style("Error:").red().bold(), msg);
    process::exit(1);
}

fn opt(s: &Option<String>) -> &str {
    s.as_deref().unwrap_or("")
}

fn list_repositories(rs: &[RepositoryRecord]) {
    let mut table = prettytable::Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(row!["Catalog", "Directory", "Discovered"]);
    for r in rs {
        table.add_row(row![
            r.file_name,
            r.file_path,
            r.discovered_at.format("%Y-%m-%d %H:%M:%S")
        ]);
    }
    table.printstd();
}

fn list_systems(ss: &[StoredSystem]) {
    let mut table = prettytable::Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(row!["System ID", "Type", "Brand", "Name"]);
    for s in ss {
        table.add_row(row![s.system_id, opt(&s.system_id_type), opt(&s.brand), opt(&s.name)]);
    }
    table.printstd();
}

fn list_components(cs: &[StoredComponent]) {
    let mut table = prettytable::Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(row!["ID", "Name", "Category", "Version", "Path"]);
    for c in cs {
        table.add_row(row![
            c.id,
            opt(&c.name),
            opt(&c.category),
            opt(&c.vendor_version),
            opt(&c.path)
        ]);
    }
    table.printstd();
}

fn list_bundles(bs: &[(String, BundleRecord)]) {
    let mut table = prettytable::Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(row!["Repository", "Bundle", "Name", "Operating systems", "Packages"]);
    for (repo, b) in bs {
        table.add_row(row![
            repo,
            opt(&b.bundle_id),
            b.name,
            b.target_oses.join(", "),
            b.packages.len()
        ]);
    }
    table.printstd();
}

fn locate(store: &PgStore, root: &Path, id: &str) {
    let id: i64 = match id.parse() {
        Ok(i) => i,
        Err(_) => fail(format!("'{}' is not a component id", id)),
    };
    let component = match store.component(id) {
        Ok(Some(c)) => c,
        Ok(None) => fail(format!("component {} not found", id)),
        Err(e) => fail(e.to_string()),
    };
    let path = match access::download_path(root, opt(&component.path)) {
        Ok(p) => p,
        Err(e) => fail(e.to_string()),
    };
    println!("{}", style(path.display()).bold());
    match access::verify_package(&path, &component.hash_md5) {
        Ok(true) => println!("MD5 {} {}", component.hash_md5, style("OK").green()),
        Ok(false) => {
            println!("MD5 {} {}", component.hash_md5, style("MISMATCH").red().bold());
            process::exit(2);
        }
        Err(e) => fail(e.to_string()),
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let params = setup_params();

    let settings = match Settings::new(params.config_file.clone()) {
        Ok(s) => s,
        Err(e) => fail(format!("Configuration file parsing failed: {}", e)),
    };

    debug::init(params.debug + usize::from(settings.debug.unwrap_or(false)));

    let store = match PgStore::connect(&settings.database.url, settings.database.pool_size) {
        Ok(s) => s,
        Err(e) => fail(format!("Connection to the database failed: {}", e)),
    };
    if let Err(e) = store.ensure_schema() {
        fail(format!("Creating the database schema failed: {}", e));
    }
    let store = Arc::new(store);
    let writer = CatalogWriter::new(&settings.parsed_path);

    if params.list_repositories {
        match store.repositories() {
            Ok(rs) => list_repositories(&rs),
            Err(e) => fail(e.to_string()),
        }
        process::exit(0);
    }

    if params.list_systems {
        match store.systems() {
            Ok(ss) => list_systems(&ss),
            Err(e) => fail(e.to_string()),
        }
        process::exit(0);
    }

    if let Some(system) = &params.system {
        match store.components_for_system(system) {
            Ok(cs) => {
                println!("{} {}", style("Components for system").bold(), system);
                list_components(&cs);
            }
            Err(e) => fail(e.to_string()),
        }
        process::exit(0);
    }

    if params.list_bundles {
        match access::bundles(&writer) {
            Ok(bs) => list_bundles(&bs),
            Err(e) => fail(e.to_string()),
        }
        process::exit(0);
    }

    if let Some(id) = &params.locate {
        locate(&store, &settings.repository_path, id);
        process::exit(0);
    }

    let reconciler = Arc::new(StorageReconciler::new(Arc::clone(&store)));

    if params.reset {
        if let Err(e) = reconciler.wipe() {
            fail(e.to_string());
        }
        let ids = match writer.repository_ids() {
            Ok(ids) => ids,
            Err(e) => fail(e.to_string()),
        };
        for id in ids {
            if let Err(e) = writer.remove(&id) {
                fail(e.to_string());
            }
        }
        println!("{}", style("All synchronized data removed").bold());
        process::exit(0);
    }

    let index = RepositoryIndex::new(&settings.repository_path, &settings.excludes());
    let gate = AvailabilityGate::new();
    let mut coordinator = SyncCoordinator::new(index, writer, reconciler, gate)
        .with_retry_delay(settings.poll_interval());
    coordinator.recover();

    if params.once {
        coordinator.run_until_idle().await;
        info!("sync cycle complete");
        process::exit(0);
    }

    let mode = resolve_mode(settings.watch_mode, &settings.repository_path);
    let _watcher = match FileWatcher::start(
        &settings.repository_path,
        &settings.parsed_path,
        mode,
        settings.poll_interval(),
        coordinator.sender(),
    ) {
        Ok(w) => w,
        Err(e) => fail(e.to_string()),
    };

    let shutdown = coordinator.sender();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                let _ = shutdown.send(SyncEvent::Shutdown);
            }
            Err(e) => error!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    coordinator.run().await;
}
