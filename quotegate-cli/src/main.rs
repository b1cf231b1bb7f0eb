//! Quotegate CLI — reference, history, intraday and live market-data queries.
//!
//! Commands:
//! - `ref` — point reference values per (ticker, field)
//! - `bulk` — array-valued reference fields, one row per element
//! - `hist` — daily history over a date range
//! - `bars` / `ticks` — intraday data for one ticker, UTC window
//! - `screen` — equity screen results
//! - `dividend` — dividend / split history shortcut
//! - `live` — stream subscription updates until interrupted or `--max`
//!
//! `--replay script.json` answers every request from a scripted session
//! instead of connecting to a provider.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use quotegate_core::options::RequestOptions;
use quotegate_core::protocol::Connector;
use quotegate_core::query::{Query, ScreenType};
use quotegate_core::record::Record;
use quotegate_core::stream::{InfoFilter, LiveUpdate, StreamRequest, StreamSubscriber};
use quotegate_core::transport::{Script, ScriptedProvider, TcpConnector};
use quotegate_runner::config::GatewayConfig;
use quotegate_runner::dispatcher::QueryDispatcher;
use quotegate_runner::table::{text, ResultTable};
use quotegate_runner::logging;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "quotegate",
    about = "Quotegate — cached market-data query gateway"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider host (overrides config and QUOTEGATE_HOST).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Provider port (overrides config and QUOTEGATE_PORT).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Cache root (overrides config and QUOTEGATE_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Answer requests from a scripted session (JSON) instead of a provider.
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace). RUST_LOG wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Args, Default)]
struct QueryArgs {
    /// Request option or override as KEY=VALUE (repeatable), e.g. Per=W,
    /// adjust=all, BEST_FPERIOD_OVERRIDE=1BF.
    #[arg(short = 'o', long = "opt", value_parser = parse_key_value)]
    opts: Vec<(String, String)>,

    /// Skip the cache lookup; fresh results are still written.
    #[arg(long, default_value_t = false)]
    reload: bool,

    /// Neither read nor write the cache.
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Staleness window in days for date-stamped cache entries.
    #[arg(long)]
    cache_days: Option<u32>,

    /// Batch mode: throttled queries are skipped silently.
    #[arg(long, default_value_t = false)]
    batch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Point reference values.
    Ref {
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Fields, comma separated.
        #[arg(short, long, required = true, value_delimiter = ',')]
        fields: Vec<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Array-valued reference fields.
    Bulk {
        #[arg(required = true)]
        tickers: Vec<String>,

        #[arg(short, long, required = true, value_delimiter = ',')]
        fields: Vec<String>,

        /// Use the portfolio-data verb (tickers are portfolio names).
        #[arg(long, default_value_t = false)]
        portfolio: bool,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Daily history.
    Hist {
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Fields, comma separated. Defaults to Last_Price.
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Intraday bars for one ticker. Times are UTC.
    Bars {
        ticker: String,

        /// Start (YYYY-MM-DDTHH:MM[:SS], UTC).
        #[arg(long)]
        start: String,

        /// End (YYYY-MM-DDTHH:MM[:SS], UTC).
        #[arg(long)]
        end: String,

        #[arg(long, default_value = "TRADE")]
        event: String,

        /// Bar size in minutes.
        #[arg(long, default_value_t = 1)]
        interval: u32,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Intraday ticks for one ticker. Times are UTC.
    Ticks {
        ticker: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Event types, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "TRADE")]
        types: Vec<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Equity screen.
    Screen {
        name: String,

        /// GLOBAL or PRIVATE.
        #[arg(long = "type", default_value = "PRIVATE")]
        screen_type: String,

        #[arg(long, default_value = "General")]
        group: String,

        /// Point-in-time date (YYYY-MM-DD).
        #[arg(long)]
        as_of: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Dividend and split history.
    Dividend {
        #[arg(required = true)]
        tickers: Vec<String>,

        /// all, dvd, split, gross, adjust, adj_fund, with_amt, dvd_amt,
        /// gross_amt, projected.
        #[arg(long = "type", default_value = "all")]
        dividend_type: String,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },
    /// Live updates.
    Live {
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Fields, comma separated. Defaults to LAST_PRICE,BID,ASK.
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Info columns: `default`, `all`, or a comma separated list.
        #[arg(long, default_value = "default")]
        info: String,

        /// Subscription options, e.g. interval=10.
        #[arg(long = "sub-opt")]
        sub_opts: Vec<String>,

        /// Stop after this many updates.
        #[arg(long)]
        max: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.global.verbose);

    let config = load_config(&cli.global)?;
    let connector = connector(cli.global.replay.as_deref())?;
    let format = cli.global.format;

    let query = match cli.command {
        Commands::Live {
            tickers,
            fields,
            info,
            sub_opts,
            max,
        } => return run_live(connector, &config, tickers, fields, &info, sub_opts, max, format),
        Commands::Ref {
            tickers,
            fields,
            query,
        } => apply(Query::point_ref(tickers, fields), &query),
        Commands::Bulk {
            tickers,
            fields,
            portfolio,
            query,
        } => {
            let base = if portfolio {
                Query::portfolio(tickers, fields)
            } else {
                Query::block_ref(tickers, fields)
            };
            apply(base, &query)
        }
        Commands::Hist {
            tickers,
            fields,
            start,
            end,
            query,
        } => {
            let start = parse_date(&start)?;
            let end = end
                .as_deref()
                .map(parse_date)
                .transpose()?
                .unwrap_or_else(|| chrono::Local::now().date_naive());
            apply(Query::time_series(tickers, fields, start, end), &query)
        }
        Commands::Bars {
            ticker,
            start,
            end,
            event,
            interval,
            query,
        } => apply(
            Query::bars(ticker, event, parse_datetime(&start)?, parse_datetime(&end)?, interval),
            &query,
        ),
        Commands::Ticks {
            ticker,
            start,
            end,
            types,
            query,
        } => apply(
            Query::ticks(ticker, types, parse_datetime(&start)?, parse_datetime(&end)?),
            &query,
        ),
        Commands::Screen {
            name,
            screen_type,
            group,
            as_of,
            query,
        } => {
            let as_of = as_of.as_deref().map(parse_date).transpose()?;
            apply(
                Query::screen(name, ScreenType::parse(&screen_type), group, as_of),
                &query,
            )
        }
        Commands::Dividend {
            tickers,
            dividend_type,
            start,
            end,
            query,
        } => {
            let start = start.as_deref().map(parse_date).transpose()?;
            let end = end.as_deref().map(parse_date).transpose()?;
            let base = Query::dividend(tickers, &dividend_type, start, end);
            if base.tickers().is_empty() {
                bail!("dividend history needs at least one plain equity ticker");
            }
            apply(base, &query)
        }
    };

    let dispatcher = QueryDispatcher::connect(connector, config);
    let table = dispatcher
        .execute(&query)
        .with_context(|| format!("{} query failed", query.kind()))?;
    debug!(records = table.len(), "writing output");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_table(&mut out, &table, format)?;
    out.flush()?;
    Ok(())
}

// ── Setup ────────────────────────────────────────────────────────────

fn load_config(global: &GlobalArgs) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::load(global.config.as_deref())?;
    if let Some(host) = &global.host {
        config.host = host.clone();
    }
    if let Some(port) = global.port {
        config.port = port;
    }
    if let Some(root) = &global.root {
        config.cache_root = Some(root.clone());
    }
    config.validate()?;
    Ok(config)
}

fn connector(replay: Option<&Path>) -> Result<Arc<dyn Connector>> {
    let Some(path) = replay else {
        return Ok(Arc::new(TcpConnector::default()));
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read replay script {}", path.display()))?;
    let script: Script = serde_json::from_str(&text)
        .with_context(|| format!("invalid replay script {}", path.display()))?;
    Ok(ScriptedProvider::from_script(script).connector())
}

/// Route `--opt` pairs: gateway keywords shape the cache policy, the rest
/// become request options.
fn apply(query: Query, args: &QueryArgs) -> Query {
    let mut policy = *query.cache_policy();
    policy.reload |= args.reload;
    policy.batch |= args.batch;
    if args.no_cache {
        policy.enabled = false;
    }
    if args.cache_days.is_some() {
        policy.staleness_days = args.cache_days;
    }
    for (key, value) in &args.opts {
        match key.as_str() {
            "cache" => policy.enabled = parse_flag(value),
            "reload" => policy.reload = parse_flag(value),
            "batch" => policy.batch = parse_flag(value),
            "has_date" => policy.has_date = parse_flag(value),
            "cache_days" => {
                if let Ok(days) = value.trim().parse() {
                    policy.staleness_days = Some(days);
                }
            }
            _ => {}
        }
    }
    let options = RequestOptions::from_keywords(args.opts.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    query.with_options(options).with_cache_policy(policy)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "y")
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%Y%m%d"))
        .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD"))
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    bail!("invalid UTC time '{s}', expected YYYY-MM-DDTHH:MM[:SS]")
}

// ── Live ─────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_live(
    connector: Arc<dyn Connector>,
    config: &GatewayConfig,
    tickers: Vec<String>,
    fields: Vec<String>,
    info: &str,
    sub_opts: Vec<String>,
    max: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let manager = quotegate_core::connection::ConnectionManager::new(connector, config.host.clone());
    let info = match info.trim() {
        "default" => InfoFilter::Default,
        "all" => InfoFilter::All,
        list => InfoFilter::Only(
            list.split(',')
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect::<BTreeSet<_>>(),
        ),
    };
    let mut request = StreamRequest::new(tickers)
        .fields(fields)
        .info(info)
        .options(sub_opts)
        .service(config.mktdata_service.clone())
        .poll_interval(config.stream_poll_interval());
    if let Some(max) = max {
        request = request.max_records(max);
    }

    let stream = StreamSubscriber::subscribe(&manager, config.port, request).context("subscription failed")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for update in stream {
        write_update(&mut out, &update?, format)?;
        out.flush()?;
    }
    Ok(())
}

fn write_update(out: &mut impl Write, update: &LiveUpdate, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(update)?)?,
        OutputFormat::Table | OutputFormat::Csv => {
            let values: Vec<String> = update
                .values
                .iter()
                .map(|(k, v)| format!("{k}={}", text(v)))
                .collect();
            writeln!(out, "{} {} {}", update.ticker, update.field, values.join(" "))?;
        }
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────

/// Header and row cells of the long-format table.
fn layout(table: &ResultTable) -> (Vec<String>, Vec<Vec<String>>) {
    let records = table.records();
    let has_field = records.iter().any(|r| r.field.is_some());
    let has_position = records.iter().any(|r| r.position.is_some());
    let has_time = records.iter().any(|r| r.timestamp.is_some());
    let columns = table.value_columns();

    let mut header = vec!["ticker".to_string()];
    if has_field {
        header.push("field".into());
    }
    if has_position {
        header.push("position".into());
    }
    if has_time {
        header.push("timestamp".into());
    }
    header.extend(columns.iter().cloned());

    let rows = records
        .iter()
        .map(|r: &Record| {
            let mut row = vec![r.ticker.clone()];
            if has_field {
                row.push(r.field.clone().unwrap_or_default());
            }
            if has_position {
                row.push(r.position.map(|p| p.to_string()).unwrap_or_default());
            }
            if has_time {
                row.push(r.timestamp.map(|t| t.to_string()).unwrap_or_default());
            }
            row.extend(columns.iter().map(|c| r.get(c).map(text).unwrap_or_default()));
            row
        })
        .collect();
    (header, rows)
}

fn write_table(out: &mut impl Write, table: &ResultTable, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            for record in table.records() {
                writeln!(out, "{}", serde_json::to_string(record)?)?;
            }
        }
        OutputFormat::Csv => {
            let (header, rows) = layout(table);
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record(&header)?;
            for row in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            if table.is_empty() {
                writeln!(out, "(no data)")?;
                return Ok(());
            }
            let (header, rows) = layout(table);
            let widths: Vec<usize> = header
                .iter()
                .enumerate()
                .map(|(i, h)| rows.iter().map(|r| r[i].len()).chain([h.len()]).max().unwrap_or(0))
                .collect();
            let line = |cells: &[String]| -> String {
                cells
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| format!("{c:<width$}", width = *w))
                    .collect::<Vec<_>>()
                    .join("  ")
                    .trim_end()
                    .to_string()
            };
            writeln!(out, "{}", line(&header))?;
            writeln!(out, "{}", "-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)))?;
            for row in &rows {
                writeln!(out, "{}", line(row))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotegate_core::query::QueryKind;
    use serde_json::{json, Value};

    #[test]
    fn key_value_parsing() {
        assert_eq!(parse_key_value("Per=W").unwrap(), ("Per".into(), "W".into()));
        assert_eq!(parse_key_value("A=b=c").unwrap(), ("A".into(), "b=c".into()));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn gateway_keywords_shape_policy_not_request() {
        let args = QueryArgs {
            opts: vec![
                ("cache_days".into(), "3".into()),
                ("reload".into(), "true".into()),
                ("Per".into(), "W".into()),
            ],
            ..Default::default()
        };
        let query = apply(Query::point_ref(["T1"], ["PX_LAST"]), &args);
        assert_eq!(query.cache_policy().staleness_days, Some(3));
        assert!(query.cache_policy().reload);
        let pairs = query.options().canonical_pairs();
        assert_eq!(pairs, vec![("periodicitySelection".to_string(), "WEEKLY".to_string())]);
    }

    #[test]
    fn datetime_formats() {
        assert!(parse_datetime("2024-01-02T14:30").is_ok());
        assert!(parse_datetime("2024-01-02 14:30:15").is_ok());
        assert!(parse_datetime("14:30").is_err());
        assert_eq!(parse_date("20240102").unwrap(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn table_and_csv_output() {
        let table = ResultTable::new(
            QueryKind::PointRef,
            vec![
                Record::reference("AAPL US Equity", "PX_LAST", json!(190.5)),
                Record::reference("AAPL US Equity", "NAME", json!("APPLE INC")),
            ],
        );
        let mut buf = Vec::new();
        write_table(&mut buf, &table, OutputFormat::Table).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("ticker"));
        assert!(text.contains("APPLE INC"));

        let mut buf = Vec::new();
        write_table(&mut buf, &table, OutputFormat::Csv).unwrap();
        let csv_text = String::from_utf8(buf).unwrap();
        assert_eq!(csv_text.lines().next(), Some("ticker,field,value"));
        assert_eq!(csv_text.lines().count(), 3);
    }

    #[test]
    fn json_lines_output() {
        let table = ResultTable::new(QueryKind::PointRef, vec![Record::reference("T1", "A", Value::Null)]);
        let mut buf = Vec::new();
        write_table(&mut buf, &table, OutputFormat::Json).unwrap();
        let line: Value = serde_json::from_str(String::from_utf8(buf).unwrap().trim()).unwrap();
        assert_eq!(line["ticker"], "T1");
    }
}
