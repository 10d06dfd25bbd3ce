//! Incremental HTML rendering of the impact log.
//!
//! Nothing here builds a page in memory. The template is read line by line,
//! the stylesheet is copied in fixed-size chunks, and the table is emitted one
//! cell at a time into a [`BufferedWriter`], which decides when bytes actually
//! reach the socket. The only sizeable allocation is the log snapshot itself,
//! and that is released as soon as the table has been written.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, BufReader};
use tracing::trace;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::writer::BufferedWriter;

/// Template token replaced by the stylesheet.
pub const CSS_PLACEHOLDER: &str = "{{CSS_PLACEHOLDER}}";

/// Template token replaced by the impact table.
pub const TABLE_PLACEHOLDER: &str = "{{TABLE_PLACEHOLDER}}";

const DEFAULT_TEMPLATE: &str = include_str!("../assets/index.html");
const DEFAULT_STYLESHEET: &str = include_str!("../assets/style.css");
const POLL_SCRIPT: &str = include_str!("../assets/poll.html");

const STYLESHEET_CHUNK: usize = 512;

/// A page asset, either compiled in or read from disk on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Static text embedded in the binary.
    Embedded(&'static str),
    /// A file opened fresh for each render.
    File(PathBuf),
}

impl Resource {
    /// Open the asset for buffered reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Asset`] if a file-backed asset cannot be opened.
    pub async fn open(&self) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
        match self {
            Self::Embedded(text) => Ok(Box::new(text.as_bytes())),
            Self::File(path) => {
                let file = File::open(path).await.map_err(|source| Error::Asset {
                    path: path.clone(),
                    source,
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }
}

/// Template, stylesheet and polling cadence used to render `/`.
#[derive(Debug, Clone)]
pub struct PageAssets {
    template: Resource,
    stylesheet: Resource,
    poll_interval: Duration,
}

impl Default for PageAssets {
    fn default() -> Self {
        Self {
            template: Resource::Embedded(DEFAULT_TEMPLATE),
            stylesheet: Resource::Embedded(DEFAULT_STYLESHEET),
            poll_interval: Duration::from_millis(2000),
        }
    }
}

impl PageAssets {
    /// Assets with explicit resources.
    #[must_use]
    pub fn new(template: Resource, stylesheet: Resource, poll_interval: Duration) -> Self {
        Self {
            template,
            stylesheet,
            poll_interval,
        }
    }

    /// Embedded assets, overridden by any paths set in the server config.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let template = config
            .template_path
            .clone()
            .map_or(Resource::Embedded(DEFAULT_TEMPLATE), Resource::File);
        let stylesheet = config
            .stylesheet_path
            .clone()
            .map_or(Resource::Embedded(DEFAULT_STYLESHEET), Resource::File);
        Self::new(template, stylesheet, config.poll_interval())
    }

    /// The page template.
    #[must_use]
    pub fn template(&self) -> &Resource {
        &self.template
    }

    /// The stylesheet.
    #[must_use]
    pub fn stylesheet(&self) -> &Resource {
        &self.stylesheet
    }
}

fn non_empty_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().map(str::trim).filter(|line| !line.is_empty())
}

async fn write_escaped<W>(writer: &mut BufferedWriter<W>, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        let entity = match ch {
            '&' => "&amp;",
            '<' => "&lt;",
            '>' => "&gt;",
            '"' => "&quot;",
            '\'' => "&#39;",
            _ => continue,
        };
        writer.write(&text[start..i]).await?;
        writer.write(entity).await?;
        start = i + ch.len_utf8();
    }
    writer.write(&text[start..]).await
}

async fn write_cells<W>(
    writer: &mut BufferedWriter<W>,
    line: &str,
    open: &str,
    close: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for cell in line.split(',') {
        writer.write(open).await?;
        write_escaped(writer, cell).await?;
        writer.write(close).await?;
    }
    Ok(())
}

async fn write_row<W>(writer: &mut BufferedWriter<W>, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write("<tr>").await?;
    write_cells(writer, line, "<td>", "</td>").await?;
    writer.write("</tr>").await
}

/// Render the whole log as a table: header row in `<thead>`, records in
/// `<tbody>`.
///
/// # Errors
///
/// Returns an error if writing to the connection fails.
pub async fn render_full_table<W>(
    writer: &mut BufferedWriter<W>,
    log_content: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut lines = non_empty_lines(log_content);

    writer.write("<table border='1' cellpadding='6'>").await?;
    if let Some(header) = lines.next() {
        writer.write("<thead><tr>").await?;
        write_cells(writer, header, "<th>", "</th>").await?;
        writer.write("</tr></thead>").await?;
    }
    writer.write("<tbody>").await?;
    for line in lines {
        write_row(writer, line).await?;
    }
    writer.write("</tbody></table>").await
}

/// Render only the record rows, for replacing a table body in place.
///
/// # Errors
///
/// Returns an error if writing to the connection fails.
pub async fn render_rows_only<W>(
    writer: &mut BufferedWriter<W>,
    log_content: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for line in non_empty_lines(log_content).skip(1) {
        write_row(writer, line).await?;
    }
    Ok(())
}

async fn stream_resource<W>(writer: &mut BufferedWriter<W>, resource: &Resource) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = resource.open().await?;
    let mut chunk = [0u8; STYLESHEET_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write(&chunk[..n]).await?;
    }
}

/// Split `text` at the first placeholder of either kind.
fn next_placeholder(text: &str) -> Option<(&str, &'static str, &str)> {
    [CSS_PLACEHOLDER, TABLE_PLACEHOLDER]
        .into_iter()
        .filter_map(|token| text.find(token).map(|at| (at, token)))
        .min_by_key(|&(at, _)| at)
        .map(|(at, token)| (&text[..at], token, &text[at + token.len()..]))
}

fn poll_script(version: u64, interval: Duration) -> String {
    POLL_SCRIPT
        .replace("{{VERSION}}", &version.to_string())
        .replace("{{INTERVAL_MS}}", &interval.as_millis().to_string())
}

/// Render the full page.
///
/// The template is forwarded line by line. Each [`CSS_PLACEHOLDER`] gets the
/// stylesheet streamed in its place and each [`TABLE_PLACEHOLDER`] gets a
/// table built from a fresh snapshot of `log`, in the order they appear.
/// The polling script, seeded with `version`, follows the template.
///
/// # Errors
///
/// Returns an error if an asset cannot be read, the log cannot be
/// snapshotted, or writing to the connection fails.
pub async fn render_page<W>(
    writer: &mut BufferedWriter<W>,
    assets: &PageAssets,
    log: &EventLog,
    version: u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut template = assets.template.open().await?;
    let mut line = String::new();

    loop {
        line.clear();
        if template.read_line(&mut line).await? == 0 {
            break;
        }

        let mut rest = line.as_str();
        while let Some((before, placeholder, after)) = next_placeholder(rest) {
            writer.write(before).await?;
            if placeholder == CSS_PLACEHOLDER {
                stream_resource(writer, &assets.stylesheet).await?;
            } else {
                let snapshot = log.snapshot()?;
                render_full_table(writer, snapshot.content()).await?;
                trace!(
                    rows = snapshot.row_count(),
                    "Releasing {} byte snapshot",
                    snapshot.content().len()
                );
                drop(snapshot);
            }
            rest = after;
        }
        writer.write(rest).await?;
    }

    writer
        .write(poll_script(version, assets.poll_interval))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::CountingSink;
    use crate::writer::DEFAULT_FLUSH_THRESHOLD;

    const EXAMPLE_LOG: &str = "Time,G-Force\n00:01:23,2.70g\n00:02:00,4.10g\n";

    async fn render_to_string<F, Fut>(render: F) -> String
    where
        F: FnOnce(BufferedWriter<Vec<u8>>) -> Fut,
        Fut: std::future::Future<Output = BufferedWriter<Vec<u8>>>,
    {
        let writer = BufferedWriter::new(Vec::new(), DEFAULT_FLUSH_THRESHOLD);
        let mut writer = render(writer).await;
        writer.flush().await.unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    fn test_log(dir: &tempfile::TempDir, rows: &[(&str, &str)]) -> EventLog {
        let log = EventLog::create(
            dir.path().join("impacts.csv"),
            &["Time".to_string(), "G-Force".to_string()],
        )
        .unwrap();
        for (timestamp, magnitude) in rows {
            log.append(timestamp, magnitude).unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_rows_only_example() {
        let html = render_to_string(|mut w| async move {
            render_rows_only(&mut w, EXAMPLE_LOG).await.unwrap();
            w
        })
        .await;

        assert_eq!(
            html,
            "<tr><td>00:01:23</td><td>2.70g</td></tr><tr><td>00:02:00</td><td>4.10g</td></tr>"
        );
        assert!(!html.contains("G-Force"));
    }

    #[tokio::test]
    async fn test_full_table() {
        let html = render_to_string(|mut w| async move {
            render_full_table(&mut w, EXAMPLE_LOG).await.unwrap();
            w
        })
        .await;

        assert!(html.starts_with("<table"));
        assert!(html.ends_with("</tbody></table>"));
        assert!(html.contains("<thead><tr><th>Time</th><th>G-Force</th></tr></thead>"));
        assert_eq!(html.matches("<th>").count(), 2);
        assert_eq!(html.matches("<tr>").count(), 3);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let content = "\n\nTime,G-Force\r\n\r\n00:00:001,3.00g\r\n\n";
        let html = render_to_string(|mut w| async move {
            render_full_table(&mut w, content).await.unwrap();
            w
        })
        .await;

        assert!(html.contains("<th>Time</th>"));
        assert!(html.contains("<tbody><tr><td>00:00:001</td><td>3.00g</td></tr></tbody>"));
    }

    #[tokio::test]
    async fn test_header_only_log() {
        let html = render_to_string(|mut w| async move {
            render_rows_only(&mut w, "Time,G-Force\n").await.unwrap();
            w
        })
        .await;
        assert!(html.is_empty());
    }

    #[tokio::test]
    async fn test_cells_are_escaped() {
        let html = render_to_string(|mut w| async move {
            render_rows_only(&mut w, "h\n<b>&x</b>,'q\"\n").await.unwrap();
            w
        })
        .await;
        assert_eq!(
            html,
            "<tr><td>&lt;b&gt;&amp;x&lt;/b&gt;</td><td>&#39;q&quot;</td></tr>"
        );
    }

    #[tokio::test]
    async fn test_table_streams_in_several_writes() {
        let content: String = std::iter::once("Time,G-Force\n".to_string())
            .chain((0..100).map(|i| format!("00:00:{i:03},2.{i:02}g\n")))
            .collect();

        let mut writer = BufferedWriter::new(CountingSink::default(), 256);
        render_full_table(&mut writer, &content).await.unwrap();
        writer.flush().await.unwrap();

        let sink = writer.into_inner();
        assert!(sink.writes > 1);
        assert_eq!(String::from_utf8(sink.data).unwrap().matches("<tr>").count(), 101);
    }

    #[tokio::test]
    async fn test_render_page_default_assets() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[("00:01:23", "2.70g"), ("00:02:00", "4.10g")]);
        let assets = PageAssets::default();

        let html = render_to_string(|mut w| async move {
            render_page(&mut w, &assets, &log, 2).await.unwrap();
            w
        })
        .await;

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(!html.contains(CSS_PLACEHOLDER));
        assert!(!html.contains(TABLE_PLACEHOLDER));
        assert!(html.contains("border-collapse"));
        assert_eq!(html.matches("<thead>").count(), 1);
        assert!(html.contains(
            "<tbody><tr><td>00:01:23</td><td>2.70g</td></tr><tr><td>00:02:00</td><td>4.10g</td></tr></tbody>"
        ));
        assert!(html.contains("var known = \"2\";"));
        assert!(html.contains("}, 2000);"));
        assert!(html.trim_end().ends_with("</script>"));
    }

    #[tokio::test]
    async fn test_render_page_keeps_text_around_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[("00:00:500", "3.20g")]);
        let assets = PageAssets::new(
            Resource::Embedded(
                "<style>{{CSS_PLACEHOLDER}}</style>\n<div>{{TABLE_PLACEHOLDER}}</div>\nfooter\n",
            ),
            Resource::Embedded("td{color:red}"),
            Duration::from_millis(750),
        );

        let html = render_to_string(|mut w| async move {
            render_page(&mut w, &assets, &log, 1).await.unwrap();
            w
        })
        .await;

        assert!(html.starts_with("<style>td{color:red}</style>\n<div><table"));
        assert!(html.contains("</table></div>\nfooter\n<script>"));
        assert!(html.contains("}, 750);"));
    }

    #[tokio::test]
    async fn test_render_page_both_placeholders_on_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[("00:00:500", "3.20g")]);
        let assets = PageAssets::new(
            Resource::Embedded("<style>{{CSS_PLACEHOLDER}}</style><p>{{TABLE_PLACEHOLDER}}</p>\n"),
            Resource::Embedded("th{color:blue}"),
            Duration::from_millis(2000),
        );

        let html = render_to_string(|mut w| async move {
            render_page(&mut w, &assets, &log, 1).await.unwrap();
            w
        })
        .await;

        assert!(html.starts_with("<style>th{color:blue}</style><p><table"));
        assert!(html.contains("<td>3.20g</td>"));
        assert!(html.contains("</table></p>\n<script>"));
        assert!(!html.contains("{{TABLE_PLACEHOLDER}}"));
    }

    #[test]
    fn test_next_placeholder_picks_earliest() {
        let line = "a{{TABLE_PLACEHOLDER}}b{{CSS_PLACEHOLDER}}c";
        let (before, token, after) = next_placeholder(line).unwrap();
        assert_eq!(before, "a");
        assert_eq!(token, TABLE_PLACEHOLDER);
        assert_eq!(after, "b{{CSS_PLACEHOLDER}}c");
        assert!(next_placeholder("plain text\n").is_none());
    }

    #[tokio::test]
    async fn test_render_page_uses_fresh_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[("00:00:001", "2.60g")]);
        let version = log.current_version();
        log.append("00:00:002", "2.90g").unwrap();

        let assets = PageAssets::new(
            Resource::Embedded("{{TABLE_PLACEHOLDER}}\n"),
            Resource::Embedded(""),
            Duration::from_millis(2000),
        );
        let html = render_to_string(|mut w| async move {
            render_page(&mut w, &assets, &log, version).await.unwrap();
            w
        })
        .await;

        assert!(html.contains("2.90g"));
        assert!(html.contains("var known = \"1\";"));
    }

    #[tokio::test]
    async fn test_stylesheet_file_streamed_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[]);
        let css: String = (0..200).map(|i| format!(".c{i}{{margin:{i}px}}\n")).collect();
        let css_path = dir.path().join("style.css");
        std::fs::write(&css_path, &css).unwrap();
        let template_path = dir.path().join("index.html");
        std::fs::write(&template_path, "<style>\n{{CSS_PLACEHOLDER}}\n</style>\n").unwrap();

        let assets = PageAssets::new(
            Resource::File(template_path),
            Resource::File(css_path),
            Duration::from_millis(2000),
        );
        let html = render_to_string(|mut w| async move {
            render_page(&mut w, &assets, &log, 0).await.unwrap();
            w
        })
        .await;

        assert!(css.len() > STYLESHEET_CHUNK);
        assert!(html.starts_with(&format!("<style>\n{css}\n</style>\n")));
    }

    #[tokio::test]
    async fn test_missing_asset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir, &[]);
        let assets = PageAssets::new(
            Resource::File(dir.path().join("missing.html")),
            Resource::Embedded(""),
            Duration::from_millis(2000),
        );

        let mut writer = BufferedWriter::new(Vec::new(), DEFAULT_FLUSH_THRESHOLD);
        let result = render_page(&mut writer, &assets, &log, 0).await;
        assert!(matches!(result, Err(Error::Asset { .. })));
    }

    #[test]
    fn test_from_config_overrides() {
        let mut config = ServerConfig::default();
        assert_eq!(
            PageAssets::from_config(&config).template(),
            &Resource::Embedded(DEFAULT_TEMPLATE)
        );

        config.stylesheet_path = Some(PathBuf::from("/srv/style.css"));
        let assets = PageAssets::from_config(&config);
        assert_eq!(
            assets.stylesheet(),
            &Resource::File(PathBuf::from("/srv/style.css"))
        );
    }

    #[test]
    fn test_default_template_has_placeholders() {
        assert!(DEFAULT_TEMPLATE.contains(CSS_PLACEHOLDER));
        assert!(DEFAULT_TEMPLATE.contains(TABLE_PLACEHOLDER));
        assert!(POLL_SCRIPT.contains("/status"));
        assert!(POLL_SCRIPT.contains("/table_rows"));
    }
}
