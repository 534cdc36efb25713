use std::ffi::OsString;
use std::path::PathBuf;

use clap::{CommandFactory, Parser};

use crate::app::AppData;
use crate::host::HostOptions;

/// Boots the .NET runtime through hostfxr and calls a managed entry point.
///
/// The entry point must have the default component signature
/// `static int Method(IntPtr args, int sizeBytes)`.
#[derive(Parser, Debug)]
#[command(name = "nativehost", version)]
pub struct HostArgs {
    /// Managed assembly to load
    pub assembly: PathBuf,

    /// Entry point method name
    pub entry_point: String,

    /// Namespace of the class holding the entry point (may be empty)
    pub namespace: String,

    /// Class holding the entry point
    pub class: String,

    /// Arguments forwarded to the entry point, verbatim
    #[arg(value_name = "ARGS")]
    pub args: Vec<OsString>,

    /// Use this hostfxr library instead of searching for one
    #[arg(long, env = "NATIVEHOST_HOSTFXR_PATH")]
    pub hostfxr: Option<PathBuf>,

    /// nethost library used to find hostfxr [default: next to this executable]
    #[arg(long, env = "NATIVEHOST_NETHOST_PATH")]
    pub nethost: Option<PathBuf>,

    /// .NET install root
    #[arg(long, env = "DOTNET_ROOT")]
    pub dotnet_root: Option<PathBuf>,

    /// Runtime config [default: <assembly>.runtimeconfig.json]
    #[arg(long)]
    pub runtime_config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// ASSEMBLY, ENTRY_POINT, NAMESPACE and CLASS.
const HOST_POSITIONALS: usize = 4;

impl HostArgs {
    /// Parses the process arguments, exiting with a usage message on error.
    pub fn parse_process_args() -> HostArgs {
        HostArgs::parse_split(std::env::args_os()).unwrap_or_else(|err| err.exit())
    }

    /// Host options are only recognised before CLASS. Everything after it is
    /// forwarded untouched, even when it looks like one of our options.
    pub fn parse_split<I, T>(argv: I) -> Result<HostArgs, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let (head, forwarded) = split_forwarded(argv.into_iter().map(Into::into).collect());
        let mut args = HostArgs::try_parse_from(head)?;
        args.args = forwarded;
        Ok(args)
    }

    pub fn into_parts(self) -> (AppData, HostOptions, bool) {
        let app = AppData {
            path: self.assembly,
            entry_point: self.entry_point,
            namespace: self.namespace,
            class: self.class,
            args: self.args,
        };
        let options = HostOptions {
            hostfxr: self.hostfxr,
            nethost: self.nethost,
            dotnet_root: self.dotnet_root,
            runtime_config: self.runtime_config,
        };
        (app, options, self.verbose)
    }
}

/// Splits argv after the last host positional. Option values are skipped
/// using the parser's own definitions so `--runtime-config X` isn't counted.
fn split_forwarded(argv: Vec<OsString>) -> (Vec<OsString>, Vec<OsString>) {
    let mut command = HostArgs::command();
    command.build();
    let mut rest = argv.into_iter();
    let mut head: Vec<OsString> = rest.next().into_iter().collect();
    let mut positionals = 0;
    let mut options_ended = false;

    while positionals < HOST_POSITIONALS {
        let Some(token) = rest.next() else { break };
        let text = token.to_str().unwrap_or_default();
        if options_ended || text == "-" || !text.starts_with('-') {
            positionals += 1;
            head.push(token);
            continue;
        }
        if text == "--" {
            options_ended = true;
            head.push(token);
            continue;
        }
        let needs_value = option_takes_value(&command, text);
        head.push(token);
        if needs_value {
            head.extend(rest.next());
        }
    }
    (head, rest.collect())
}

fn option_takes_value(command: &clap::Command, option: &str) -> bool {
    let arg = match option.strip_prefix("--") {
        Some(long) if long.contains('=') => return false,
        Some(long) => command.get_arguments().find(|a| a.get_long() == Some(long)),
        None => {
            let mut shorts = option.chars().skip(1);
            match (shorts.next(), shorts.next()) {
                (Some(short), None) => {
                    command.get_arguments().find(|a| a.get_short() == Some(short))
                }
                _ => None,
            }
        }
    };
    arg.is_some_and(|a| a.get_action().takes_values())
}
