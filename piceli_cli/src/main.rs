#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate libc;
extern crate loggerv;

extern crate piceli;

use piceli::*;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::path::Path;
use std::process;
use std::time::Duration;

fn print_error_debug(e: &Error) {
    // unwind the error chain
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

fn folder_args<'a, 'b>(sub: App<'a, 'b>) -> App<'a, 'b> {
    sub.arg(
        Arg::with_name("folder")
            .short("f")
            .long("folder")
            .takes_value(true)
            .required(true)
            .help("Folder containing the object manifests"),
    )
    .arg(
        Arg::with_name("recursive")
            .short("r")
            .long("recursive")
            .help("Descend into sub folders as well"),
    )
    .arg(
        Arg::with_name("namespace")
            .short("n")
            .long("namespace")
            .takes_value(true)
            .help("Target namespace for objects that do not set one"),
    )
}

#[tokio::main]
async fn main() {
    let app = App::new("piceli")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Dependency-aware declarative deployment for kubernetes")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase verbosity"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("Adds line numbers to log statements"),
        )
        .subcommand(
            SubCommand::with_name("model")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Inspect the loaded object model")
                .subcommand(folder_args(
                    SubCommand::with_name("list")
                        .about("List identity and origin for every loaded object"),
                )),
        )
        .subcommand(
            SubCommand::with_name("deploy")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Plan and execute deployments")
                .subcommand(folder_args(
                    SubCommand::with_name("plan")
                        .about("Compute the layered deployment plan")
                        .arg(
                            Arg::with_name("validate")
                                .long("validate")
                                .help("Also reject cycles and dangling references"),
                        )
                        .arg(
                            Arg::with_name("dot")
                                .long("dot")
                                .help("Emit the dependency graph in graphviz format"),
                        ),
                ))
                .subcommand(folder_args(
                    SubCommand::with_name("detail")
                        .about("Show desired vs live state per object")
                        .arg(
                            Arg::with_name("hide-no-action")
                                .long("hide-no-action")
                                .help("Suppress objects that are already in sync"),
                        ),
                ))
                .subcommand(folder_args(
                    SubCommand::with_name("run")
                        .about("Execute the plan against the cluster")
                        .arg(
                            Arg::with_name("create-namespace")
                                .short("c")
                                .long("create-namespace")
                                .help("Create missing target namespaces before level 0"),
                        )
                        .arg(
                            Arg::with_name("jobs")
                                .short("j")
                                .long("num-jobs")
                                .takes_value(true)
                                .help("Number of concurrent workers per level"),
                        )
                        .arg(
                            Arg::with_name("timeout")
                                .long("timeout")
                                .takes_value(true)
                                .help("Overall deploy budget in seconds"),
                        )
                        .arg(
                            Arg::with_name("readiness-timeout")
                                .long("readiness-timeout")
                                .takes_value(true)
                                .help("Per object readiness budget in seconds"),
                        ),
                )),
        );

    // arg parse
    let args = app.get_matches();
    let name = args.subcommand_name().unwrap_or("piceli");
    match run(&args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{} error: {}", name, e);
            print_error_debug(&e);
            process::exit(1);
        }
    }
}

async fn run(args: &ArgMatches<'_>) -> Result<i32> {
    // initialise deps and set log default - always show INFO messages (+1)
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(true)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    // See https://github.com/rust-lang/rust/issues/46016
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    dispatch_commands(args).await
}

/// Load the object set a subcommand points at.
fn load_set(args: &ArgMatches<'_>) -> Result<ObjectSet> {
    let folder = args.value_of("folder").unwrap_or(".");
    let objects = loader::load_folder(Path::new(folder), args.is_present("recursive"))?;
    let set = ObjectSet::new(objects)?;
    match args.value_of("namespace") {
        Some(ns) => Ok(set.with_namespace(ns)?),
        None => Ok(set),
    }
}

fn parse_secs(args: &ArgMatches<'_>, name: &str) -> Result<Option<Duration>> {
    match args.value_of(name) {
        None => Ok(None),
        Some(raw) => {
            let secs: u64 = raw
                .parse()
                .chain_err(|| format!("--{} takes a number of seconds", name))?;
            Ok(Some(Duration::from_secs(secs)))
        }
    }
}

/// Dispatch clap arguments to piceli handlers
async fn dispatch_commands(args: &ArgMatches<'_>) -> Result<i32> {
    if let Some(a) = args.subcommand_matches("model") {
        if let Some(b) = a.subcommand_matches("list") {
            let set = load_set(b)?;
            list::models(&set)?;
            return Ok(0);
        }
    }

    if let Some(a) = args.subcommand_matches("deploy") {
        if let Some(b) = a.subcommand_matches("plan") {
            let set = load_set(b)?;
            if b.is_present("dot") {
                let g = graph::build(&set, b.is_present("validate"))?;
                graph::levels(&g)?; // cycle check even for dot output
                println!("{}", graph::to_dot(&g));
            } else {
                let layered = graph::plan(&set, b.is_present("validate"))?;
                print!("{}", layered.render());
            }
            return Ok(0);
        }

        if let Some(b) = a.subcommand_matches("detail") {
            let set = load_set(b)?;
            kubectl::ensure_installed()?;
            debug!("using kube context {}", kubectl::current_context().await?);
            let transport = kubectl::KubectlTransport::new();
            apply::detail(&set, &transport, b.is_present("hide-no-action")).await?;
            return Ok(0);
        }

        if let Some(b) = a.subcommand_matches("run") {
            let set = load_set(b)?;
            kubectl::ensure_installed()?;
            info!("deploying via kube context {}", kubectl::current_context().await?);
            let transport = kubectl::KubectlTransport::new();
            let mut opts = apply::ApplyOptions::default();
            opts.create_namespace = b.is_present("create-namespace");
            if let Some(jobs) = b.value_of("jobs") {
                opts.parallelism = jobs
                    .parse()
                    .chain_err(|| "--num-jobs takes a worker count")?;
            }
            opts.deploy_timeout = parse_secs(b, "timeout")?;
            if let Some(t) = parse_secs(b, "readiness-timeout")? {
                opts.readiness_timeout = t;
            }
            let report = apply::run(&set, &transport, &opts).await?;
            for failure in &report.failures {
                error!("{}", failure);
            }
            for failure in &report.rollback_failures {
                error!("rollback: {}", failure);
            }
            info!("deploy finished: {}", report.state);
            return Ok(report.exit_code());
        }
    }

    unreachable!("Subcommand valid, but not implemented");
}
