//! audience-host: open a web app in an audience runtime window.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use audience::{Controller, LaunchOptions, Platform, WindowDetails, config::parse_load_order};
use clap::{ArgGroup, Parser};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How long the runtime gets to honor `quit` before it is killed.
const QUIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "audience-host")]
#[command(about = "Launch the audience runtime and open a web app window")]
#[command(group(ArgGroup::new("app").required(true).args(["dir", "url"])))]
struct Cli {
    /// Directory served by the runtime as the web app
    #[arg(long)]
    dir: Option<String>,

    /// URL to load instead of a local directory
    #[arg(long)]
    url: Option<String>,

    /// Window title
    #[arg(long)]
    title: Option<String>,

    /// Window size as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_pair)]
    size: Option<(f64, f64)>,

    /// Window position as X,Y
    #[arg(long, value_parser = parse_pair)]
    pos: Option<(f64, f64)>,

    /// Hide window decorations
    #[arg(long)]
    undecorated: bool,

    /// Disallow resizing
    #[arg(long)]
    fixed_size: bool,

    /// Keep the window above others
    #[arg(long)]
    top: bool,

    /// Enable web developer tools
    #[arg(long)]
    dev: bool,

    /// Runtime executable (defaults to $AUDIENCE_RUNTIME_DIR/audience)
    #[arg(long, env = "AUDIENCE_RUNTIME")]
    runtime: Option<PathBuf>,

    /// Nucleus load order on Windows, e.g. edge,ie11
    #[arg(long)]
    win: Option<String>,

    /// Nucleus load order on macOS
    #[arg(long)]
    mac: Option<String>,

    /// Nucleus load order on other Unix systems
    #[arg(long)]
    unix: Option<String>,

    /// Application icons, comma separated
    #[arg(long, value_delimiter = ',')]
    icons: Vec<PathBuf>,

    /// Relay runtime stdout/stderr into the log
    #[arg(long)]
    debug: bool,

    /// Seconds to wait for the runtime to connect
    #[arg(long)]
    connect_timeout: Option<u64>,
}

impl Cli {
    fn launch_options(&self) -> Result<LaunchOptions> {
        let mut options = LaunchOptions::new()
            .with_debug(self.debug)
            .with_icons(self.icons.iter().cloned());

        if let Some(ref runtime) = self.runtime {
            options = options.with_runtime_path(runtime);
        }
        if let Some(secs) = self.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(secs));
        }

        for (platform, order) in [
            (Platform::Windows, &self.win),
            (Platform::MacOs, &self.mac),
            (Platform::Unix, &self.unix),
        ] {
            if let Some(csv) = order {
                options = options.with_load_order(platform, parse_load_order(platform, csv)?)?;
            }
        }

        Ok(options)
    }

    fn window_details(&self) -> Result<WindowDetails> {
        let mut details = match (&self.dir, &self.url) {
            (Some(dir), None) => WindowDetails::dir(dir),
            (None, Some(url)) => WindowDetails::url(url),
            _ => bail!("exactly one of --dir or --url is required"),
        };

        if let Some(ref title) = self.title {
            details = details.with_title(title);
        }
        if let Some((width, height)) = self.size {
            details = details.with_size(width, height);
        }
        if let Some((x, y)) = self.pos {
            details = details.with_pos(x, y);
        }
        if self.undecorated {
            details = details.with_decorated(false);
        }
        if self.fixed_size {
            details = details.with_resizable(false);
        }
        if self.top {
            details = details.with_top(true);
        }
        if self.dev {
            details = details.with_dev(true);
        }

        Ok(details)
    }
}

fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    let (a, b) = s
        .split_once(['x', ','])
        .ok_or_else(|| format!("expected two numbers, got {s:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("{v:?}: {e}"))
    };
    Ok((parse(a)?, parse(b)?))
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("AUDIENCE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("audience={level},audience_host={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Close windows on request and quit with the last one.
fn install_window_policy(controller: &Controller) {
    controller.on_window_message(|handle, message| {
        tracing::info!(%handle, %message, "Window message");
    });

    controller.on_window_close_intent({
        let controller = controller.clone();
        move |handle| {
            let controller = controller.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.window_destroy(handle).await {
                    tracing::warn!(%handle, error = %e, "Failed to destroy window");
                }
            });
        }
    });

    controller.on_window_close({
        let controller = controller.clone();
        move |handle, is_last_window| {
            tracing::info!(%handle, is_last_window, "Window closed");
            if is_last_window {
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.quit().await {
                        tracing::debug!(error = %e, "Quit not acknowledged");
                    }
                });
            }
        }
    });

    controller.on_app_quit(|| tracing::info!("Runtime is quitting"));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let options = cli.launch_options()?;
    let details = cli.window_details()?;

    let session = audience::launch(options)
        .await
        .context("failed to launch runtime")?;
    let controller = session.controller().clone();
    install_window_policy(&controller);

    let handle = controller
        .window_create(&details)
        .await
        .context("failed to create window")?;
    tracing::info!(%handle, "Window opened");

    let exit = tokio::select! {
        exit = session.wait() => exit,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; asking runtime to quit");
            if let Err(e) = controller.quit().await {
                tracing::debug!(error = %e, "Quit not acknowledged");
            }
            match tokio::time::timeout(QUIT_GRACE, session.wait()).await {
                Ok(exit) => exit,
                Err(_) => {
                    tracing::warn!(grace = ?QUIT_GRACE, "Runtime ignored quit; killing");
                    session.kill();
                    session.wait().await
                }
            }
        }
    };

    if !exit.success {
        bail!("runtime exited abnormally ({exit})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn requires_exactly_one_app_source() {
        assert!(Cli::try_parse_from(["audience-host"]).is_err());
        assert!(Cli::try_parse_from(["audience-host", "--dir", "a", "--url", "b"]).is_err());
        assert!(Cli::try_parse_from(["audience-host", "--dir", "a"]).is_ok());
    }

    #[test]
    fn window_flags_map_to_details() {
        let cli = Cli::try_parse_from([
            "audience-host",
            "--url",
            "https://example.com",
            "--size",
            "800x600",
            "--pos",
            "10,20",
            "--undecorated",
            "--top",
        ])
        .unwrap();

        assert_eq!(
            cli.window_details().unwrap(),
            WindowDetails::url("https://example.com")
                .with_size(800.0, 600.0)
                .with_pos(10.0, 20.0)
                .with_decorated(false)
                .with_top(true)
        );
    }

    #[test]
    fn load_orders_are_validated() {
        let cli = Cli::try_parse_from(["audience-host", "--dir", "app", "--mac", "ie11"]).unwrap();
        assert!(cli.launch_options().is_err());

        let cli = Cli::try_parse_from([
            "audience-host",
            "--dir",
            "app",
            "--win",
            "edge,ie11",
            "--icons",
            "a.png,b.png",
        ])
        .unwrap();
        let options = cli.launch_options().unwrap();
        assert_eq!(options.win.len(), 2);
        assert_eq!(options.icons.len(), 2);
    }

    #[test]
    fn pairs_accept_x_and_comma() {
        assert_eq!(parse_pair("800x600"), Ok((800.0, 600.0)));
        assert_eq!(parse_pair("10, 20"), Ok((10.0, 20.0)));
        assert!(parse_pair("800").is_err());
    }
}
