//! The external tile cache service, reached through a command-line protocol.
//!
//! [`SeedCommand`] is the capability the seeding engine is handed; the real
//! implementation, [`TegolaCommand`], spawns `tegola cache seed tile-list -`,
//! feeds the tile list on stdin and streams stdout lines back to the caller.

use std::{
    fmt,
    future::Future,
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Split},
    process::Command,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    tiles::TileCoordinate,
};

/// One run of the external tool over a list of tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedInvocation {
    pub tiles: Vec<TileCoordinate>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Worker count handed to the tool itself.
    pub concurrency: usize,
}

impl SeedInvocation {
    /// Builds an invocation spanning the zoom range of `tiles`.
    pub fn new(tiles: Vec<TileCoordinate>, concurrency: usize) -> Self {
        let min_zoom = tiles.iter().map(|tile| tile.z).min().unwrap_or(0);
        let max_zoom = tiles.iter().map(|tile| tile.z).max().unwrap_or(0);
        Self {
            tiles,
            min_zoom,
            max_zoom,
            concurrency,
        }
    }

    /// The tile list as fed to the tool, one `z/x/y` per line.
    pub fn tile_list(&self) -> String {
        self.tiles.iter().map(|tile| format!("{tile}\n")).collect()
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedExit {
    pub code: Option<i32>,
}

impl SeedExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for SeedExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for SeedExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("no exit code (terminated by signal)"),
        }
    }
}

/// Callback receiving each stdout line as it is produced.
pub type LineSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Runs the external cache service.
pub trait SeedCommand: Send + Sync {
    fn run(
        &self,
        invocation: &SeedInvocation,
        on_line: &mut LineSink<'_>,
    ) -> impl Future<Output = Result<SeedExit>> + Send;
}

/// Invokes `tegola cache seed` as a child process.
#[derive(Debug, Clone)]
pub struct TegolaCommand {
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub map: String,
    /// Kill the child if it runs longer than this.
    pub watchdog: Option<Duration>,
}

impl TegolaCommand {
    pub fn args(&self, invocation: &SeedInvocation) -> Vec<String> {
        vec![
            "cache".to_string(),
            "seed".to_string(),
            "tile-list".to_string(),
            "-".to_string(),
            format!("--config={}", self.config_path.display()),
            format!("--map={}", self.map),
            "--min-zoom".to_string(),
            invocation.min_zoom.to_string(),
            "--max-zoom".to_string(),
            invocation.max_zoom.to_string(),
            format!("--concurrency={}", invocation.concurrency),
        ]
    }

    async fn drive(&self, invocation: &SeedInvocation, on_line: &mut LineSink<'_>) -> Result<SeedExit> {
        let mut child = Command::new(&self.program)
            .args(self.args(invocation))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::SeedSpawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = invocation.tile_list();

        // The tool may exit before consuming the whole list; its exit status
        // decides the outcome, not the write.
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return;
            };
            let written = match stdin.write_all(input.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("seed command closed stdin before reading every tile");
                }
                Err(e) => warn!(error = %e, "failed to write tile list to seed command"),
            }
        };

        let read = async {
            let mut stdout = stdout.map(|out| BufReader::new(out).split(b'\n'));
            let mut stderr = stderr.map(|err| BufReader::new(err).split(b'\n'));
            while stdout.is_some() || stderr.is_some() {
                tokio::select! {
                    line = next_line(&mut stdout), if stdout.is_some() => match line? {
                        Some(line) => on_line(&line),
                        None => stdout = None,
                    },
                    line = next_line(&mut stderr), if stderr.is_some() => match line? {
                        Some(line) => trace!(target: "tiler_bench::tegola", "{line}"),
                        None => stderr = None,
                    },
                }
            }
            Ok::<_, Error>(())
        };

        let ((), read) = tokio::join!(feed, read);
        read?;
        let status = child.wait().await?;
        Ok(status.into())
    }
}

/// Next line of output, with invalid UTF-8 replaced rather than rejected.
async fn next_line<R>(lines: &mut Option<Split<R>>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = lines else {
        return Ok(None);
    };
    Ok(lines.next_segment().await?.map(|bytes| {
        let line = String::from_utf8_lossy(&bytes);
        line.strip_suffix('\r').unwrap_or(&line).to_string()
    }))
}

impl SeedCommand for TegolaCommand {
    async fn run(&self, invocation: &SeedInvocation, on_line: &mut LineSink<'_>) -> Result<SeedExit> {
        debug!(
            program = %self.program.display(),
            tiles = invocation.tiles.len(),
            min_zoom = invocation.min_zoom,
            max_zoom = invocation.max_zoom,
            concurrency = invocation.concurrency,
            "invoking seed command"
        );
        match self.watchdog {
            Some(limit) => tokio::time::timeout(limit, self.drive(invocation, on_line))
                .await
                .map_err(|_| Error::SeedWatchdog(limit))?,
            None => self.drive(invocation, on_line).await,
        }
    }
}

/// A completion report parsed from the tool's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TookLine {
    pub tile: TileCoordinate,
    /// The elapsed-time token exactly as printed, e.g. `1.52s`.
    pub elapsed: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TookLineError {
    #[error("no z/x/y tile token in `{0}`")]
    MissingTile(String),
    #[error("no elapsed time after `took` in `{0}`")]
    MissingElapsed(String),
}

const TOOK: &str = "took";

/// Parses a line such as
/// `2024/01/01 12:00:00 seed.go:45: seeding map (osm) tile (10/301/384) took: 1.52s`.
///
/// Lines without the word `took` are not completion reports and yield
/// `Ok(None)`. A completion report must carry a `z/x/y` token (optionally
/// wrapped in brackets or punctuation) and end with the elapsed-time token.
pub fn parse_took_line(line: &str) -> Result<Option<TookLine>, TookLineError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(took_at) = tokens
        .iter()
        .position(|token| token.trim_end_matches(':') == TOOK)
    else {
        return Ok(None);
    };

    let tile = tokens[..took_at]
        .iter()
        .rev()
        .find_map(|token| {
            token
                .trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<TileCoordinate>()
                .ok()
        })
        .ok_or_else(|| TookLineError::MissingTile(line.to_string()))?;

    let elapsed = tokens[took_at + 1..]
        .last()
        .ok_or_else(|| TookLineError::MissingElapsed(line.to_string()))?;

    Ok(Some(TookLine {
        tile,
        elapsed: elapsed.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(s: &str) -> TileCoordinate {
        s.parse().unwrap()
    }

    #[test]
    fn invocation_spans_zoom_range_of_its_tiles() {
        let invocation = SeedInvocation::new(vec![tile("9/1/1"), tile("7/0/0"), tile("8/2/2")], 32);
        assert_eq!((invocation.min_zoom, invocation.max_zoom), (7, 9));
        assert_eq!(invocation.tile_list(), "9/1/1\n7/0/0\n8/2/2\n");
    }

    #[test]
    fn tegola_arguments_carry_zoom_bounds_and_concurrency() {
        let command = TegolaCommand {
            program: "tegola".into(),
            config_path: "/opt/tegola_config/config.toml".into(),
            map: "osm".to_string(),
            watchdog: None,
        };
        let args = command.args(&SeedInvocation::new(vec![tile("10/5/6")], 32));
        assert_eq!(
            args,
            [
                "cache",
                "seed",
                "tile-list",
                "-",
                "--config=/opt/tegola_config/config.toml",
                "--map=osm",
                "--min-zoom",
                "10",
                "--max-zoom",
                "10",
                "--concurrency=32",
            ]
        );
    }

    #[test]
    fn parses_tegola_completion_line() {
        let line = "2024/01/01 12:00:00 seed.go:45: seeding map (osm) tile (10/301/384) took: 1.52s";
        assert_eq!(
            parse_took_line(line).unwrap(),
            Some(TookLine {
                tile: tile("10/301/384"),
                elapsed: "1.52s".to_string(),
            })
        );
    }

    #[test]
    fn parses_bare_tile_token() {
        let line = "tile 8/73/97 took 250ms";
        let took = parse_took_line(line).unwrap().unwrap();
        assert_eq!(took.tile, tile("8/73/97"));
        assert_eq!(took.elapsed, "250ms");
    }

    #[test]
    fn other_lines_are_not_reports() {
        assert_eq!(parse_took_line("starting seed worker 3").unwrap(), None);
        assert_eq!(parse_took_line("").unwrap(), None);
    }

    #[test]
    fn report_without_tile_is_an_error() {
        assert!(matches!(
            parse_took_line("seeding map (osm) took: 1.2s"),
            Err(TookLineError::MissingTile(_))
        ));
    }

    #[test]
    fn report_without_elapsed_is_an_error() {
        assert!(matches!(
            parse_took_line("tile (10/301/384) took:"),
            Err(TookLineError::MissingElapsed(_))
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-tegola");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn command(program: PathBuf, watchdog: Option<Duration>) -> TegolaCommand {
            TegolaCommand {
                program,
                config_path: "config.toml".into(),
                map: "osm".to_string(),
                watchdog,
            }
        }

        #[tokio::test]
        async fn streams_stdout_lines_from_stdin_tiles() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                &dir,
                "while read t; do echo \"seeding map (osm) tile ($t) took: 5ms\"; echo noise >&2; done",
            );
            let invocation = SeedInvocation::new(vec![tile("3/1/2"), tile("3/2/2")], 4);

            let mut lines = vec![];
            let exit = command(program, None)
                .run(&invocation, &mut |line: &str| lines.push(line.to_string()))
                .await
                .unwrap();

            assert!(exit.success());
            assert_eq!(lines.len(), 2);
            assert_eq!(parse_took_line(&lines[1]).unwrap().unwrap().tile, tile("3/2/2"));
        }

        #[tokio::test]
        async fn tool_that_stops_reading_early_keeps_its_output_and_status() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "read t; echo \"seeding map (osm) tile ($t) took: 1ms\"; exit 0");
            // far more than a pipe buffer holds
            let tiles = (0..20_000).map(|x| TileCoordinate::new(15, x, 0).unwrap()).collect();
            let invocation = SeedInvocation::new(tiles, 4);

            let mut lines = vec![];
            let exit = command(program, Some(Duration::from_secs(30)))
                .run(&invocation, &mut |line: &str| lines.push(line.to_string()))
                .await
                .unwrap();

            assert!(exit.success());
            assert_eq!(lines.len(), 1);
            assert_eq!(parse_took_line(&lines[0]).unwrap().unwrap().tile, tile("15/0/0"));
        }

        #[tokio::test]
        async fn undecodable_output_does_not_fail_the_run() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(
                &dir,
                "cat > /dev/null; printf 'bad \\377\\376 bytes\\n' >&2; echo \"tile (3/1/2) took: 2ms\"",
            );
            let invocation = SeedInvocation::new(vec![tile("3/1/2")], 4);

            let mut lines = vec![];
            let exit = command(program, None)
                .run(&invocation, &mut |line: &str| lines.push(line.to_string()))
                .await
                .unwrap();

            assert!(exit.success());
            assert_eq!(lines, ["tile (3/1/2) took: 2ms"]);
        }

        #[tokio::test]
        async fn reports_nonzero_exit() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "cat > /dev/null; exit 3");
            let invocation = SeedInvocation::new(vec![tile("3/1/2")], 4);

            let exit = command(program, None)
                .run(&invocation, &mut |_: &str| {})
                .await
                .unwrap();
            assert_eq!(exit.code, Some(3));
            assert!(!exit.success());
        }

        #[tokio::test]
        async fn watchdog_kills_hung_command() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "exec sleep 30");
            let invocation = SeedInvocation::new(vec![tile("3/1/2")], 4);

            let result = command(program, Some(Duration::from_millis(200)))
                .run(&invocation, &mut |_: &str| {})
                .await;
            assert!(matches!(result, Err(Error::SeedWatchdog(_))));
        }

        #[tokio::test]
        async fn missing_program_fails_to_spawn() {
            let invocation = SeedInvocation::new(vec![tile("3/1/2")], 4);
            let result = command("/nonexistent/tegola".into(), None)
                .run(&invocation, &mut |_: &str| {})
                .await;
            assert!(matches!(result, Err(Error::SeedSpawn { .. })));
        }
    }
}
