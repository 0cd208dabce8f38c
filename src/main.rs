use anyhow::Context;
use clap::{ArgAction, Parser};
use csv_core::{ReadFieldResult, ReaderBuilder};
use lasso::{Rodeo, RodeoResolver, Spur};
use matrix_row_keys::{Matrix, MatrixError, MinimalKeys, RowKey, Value};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::str;
use thiserror::Error;
use tracing::{info, warn};

/// Given a labelled 2D matrix of values, print the combinations of column values that uniquely
/// determine each row.
///
/// For example, this input:
///
///        x1  x2
///    y1  1   2
///    y2  1   3
///
/// prints:
///
///    y1  {x2=2}
///    y2  {x2=3}
#[derive(Debug, Parser)]
#[command(name = "matrix-row-keys")]
#[command(version, verbatim_doc_comment)]
struct Cli {
    /// Matrix to read; standard input if omitted. The first line names the columns.
    file: Option<PathBuf>,

    /// Field delimiter, a single byte
    #[arg(long, default_value = "\t", value_parser = parse_delimiter)]
    delim: u8,

    /// The first column holds data rather than row names; rows are numbered from 1 instead.
    /// Empty lines are skipped, so an empty cell in a one-column matrix must be written as "".
    #[arg(long)]
    no_row_names: bool,

    /// Log more detail to stderr (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_delimiter(s: &str) -> Result<u8, String> {
    match s {
        "\\t" | "tab" => Ok(b'\t'),
        _ if s.len() == 1 => Ok(s.as_bytes()[0]),
        _ => Err(format!("delimiter must be a single byte, not {:?}", s)),
    }
}

#[derive(Clone, Copy, Debug)]
struct LoadOptions {
    delimiter: u8,
    row_names: bool,
}

impl From<&Cli> for LoadOptions {
    fn from(cli: &Cli) -> Self {
        LoadOptions {
            delimiter: cli.delim,
            row_names: !cli.no_row_names,
        }
    }
}

#[derive(Debug, Error)]
enum LoadError {
    #[error("failed to read input")]
    Io(#[from] io::Error),

    #[error("field on line {line} is not valid UTF-8")]
    Utf8 {
        line: u64,
        #[source]
        source: str::Utf8Error,
    },

    #[error("input has no header line")]
    MissingHeader,

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

fn load_data<I: io::Read, V: Value + Default + lasso::Key>(
    mut input: I,
    options: LoadOptions,
) -> Result<(RodeoResolver<V>, Matrix<V>), LoadError> {
    let mut inputbuf = [0; 16384];
    let mut fieldbuf = vec![0; 1024];
    let mut fieldlen = 0;
    let mut header: Option<Vec<String>> = None;
    let mut column_names = Vec::new();
    let mut row_name = None;
    let mut record = Vec::new();
    let mut record_fields = 0;
    let mut record_blank = true;
    let mut row_names = Vec::new();
    let mut rows = Vec::new();
    let mut rodeo = Rodeo::new();
    let mut dsv = ReaderBuilder::new().delimiter(options.delimiter).build();

    loop {
        let read = input.read(&mut inputbuf)?;
        let mut bytes = &inputbuf[..read];
        loop {
            let (result, nin, nout) = dsv.read_field(bytes, &mut fieldbuf[fieldlen..]);
            bytes = &bytes[nin..];
            fieldlen += nout;
            match result {
                ReadFieldResult::InputEmpty => break,
                ReadFieldResult::OutputFull => {
                    let len = fieldbuf.len();
                    fieldbuf.resize(len * 2, 0);
                }
                ReadFieldResult::Field { record_end } => {
                    let field = str::from_utf8(&fieldbuf[..fieldlen]).map_err(|source| {
                        LoadError::Utf8 {
                            line: dsv.line(),
                            source,
                        }
                    })?;
                    fieldlen = 0;
                    record_fields += 1;
                    record_blank &= field.is_empty();

                    if header.is_none() {
                        column_names.push(field.to_string());
                    } else if options.row_names && row_name.is_none() {
                        row_name = Some(field.to_string());
                    } else {
                        record.push(rodeo.get_or_intern(field));
                    }

                    if !record_end {
                        continue;
                    }

                    // A record holding one empty field is a blank line, unless records are
                    // one field wide, where it is a quoted empty cell.
                    let width = header
                        .as_ref()
                        .map(|h| h.len() + options.row_names as usize);
                    let blank = record_fields == 1 && record_blank && width != Some(1);
                    record_fields = 0;
                    record_blank = true;

                    if blank {
                        column_names.clear();
                        row_name = None;
                        record.clear();
                    } else if header.is_none() {
                        // The header's first field sits above the row names.
                        if options.row_names && !column_names.is_empty() {
                            column_names.remove(0);
                        }
                        header = Some(column_names.split_off(0));
                    } else {
                        let name = row_name
                            .take()
                            .unwrap_or_else(|| (rows.len() + 1).to_string());
                        row_names.push(name);
                        rows.push(record.split_off(0));
                    }
                }
                ReadFieldResult::End => {
                    let column_names = header.ok_or(LoadError::MissingHeader)?;
                    let matrix = Matrix::new(column_names, row_names, rows)?;
                    return Ok((rodeo.into_resolver(), matrix));
                }
            }
        }
    }
}

fn write_report<W: Write, V: Value + lasso::Key>(
    mut out: W,
    matrix: &Matrix<V>,
    resolver: &RodeoResolver<V>,
    keys: &MinimalKeys<V>,
) -> io::Result<()> {
    for name in matrix.row_names() {
        write!(out, "{}", name)?;
        match keys.get(name) {
            Some(row_keys) if !row_keys.is_empty() => {
                let resolved: BTreeSet<RowKey<&str>> = row_keys
                    .iter()
                    .map(|key| {
                        key.pairs()
                            .map(|(column, value)| (column.to_string(), resolver.resolve(value)))
                            .collect()
                    })
                    .collect();
                for key in resolved {
                    write!(out, "\t{}", key)?;
                }
            }
            _ => warn!(row = %name, "no combination of columns identifies this row"),
        }
        writeln!(out)?;
    }
    out.flush()
}

fn log_level(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

fn init_logging(verbose: u8, quiet: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(log_level(verbose, quiet))
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;
    let options = LoadOptions::from(&cli);

    let (resolver, matrix) = match &cli.file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            load_data::<_, Spur>(io::BufReader::new(file), options)
                .with_context(|| format!("failed to load matrix from {}", path.display()))?
        }
        None => load_data::<_, Spur>(io::stdin().lock(), options)
            .context("failed to load matrix from standard input")?,
    };

    info!(
        columns = matrix.column_names().len(),
        rows = matrix.row_names().len(),
        "loaded matrix"
    );
    if matrix.is_empty() {
        warn!("matrix has no rows or no columns");
    }

    let keys = matrix.minimal_keys();
    let stdout = io::stdout();
    write_report(io::BufWriter::new(stdout.lock()), &matrix, &resolver, &keys)
        .context("failed to write report")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_NAMES: LoadOptions = LoadOptions {
        delimiter: b'\t',
        row_names: true,
    };

    type Loaded = (RodeoResolver<Spur>, Matrix<Spur>);

    fn load(input: &str, options: LoadOptions) -> Result<Loaded, LoadError> {
        load_data::<_, Spur>(input.as_bytes(), options)
    }

    fn report(input: &str, options: LoadOptions) -> String {
        let (resolver, matrix) = load(input, options).unwrap();
        let keys = matrix.minimal_keys();
        let mut out = Vec::new();
        write_report(&mut out, &matrix, &resolver, &keys).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn values(resolver: &RodeoResolver<Spur>, row: &[Spur]) -> Vec<String> {
        row.iter().map(|v| resolver.resolve(v).to_string()).collect()
    }

    #[test]
    fn loads_row_names_and_drops_corner_cell() {
        let (resolver, matrix) = load("gene\tx1\tx2\ny1\t1\t2\ny2\t1\t3\n", WITH_NAMES).unwrap();
        assert_eq!(matrix.column_names(), ["x1", "x2"]);
        assert_eq!(matrix.row_names(), ["y1", "y2"]);
        assert_eq!(values(&resolver, &matrix.rows()[0]), ["1", "2"]);
        assert_eq!(values(&resolver, &matrix.rows()[1]), ["1", "3"]);
    }

    #[test]
    fn numbers_rows_without_row_names() {
        let options = LoadOptions {
            delimiter: b',',
            row_names: false,
        };
        let (resolver, matrix) = load("x1,x2\r\na,b\r\n\r\nc,d\r\n", options).unwrap();
        assert_eq!(matrix.column_names(), ["x1", "x2"]);
        assert_eq!(matrix.row_names(), ["1", "2"]);
        assert_eq!(values(&resolver, &matrix.rows()[1]), ["c", "d"]);
    }

    #[test]
    fn long_fields_are_read_whole() {
        let long = "v".repeat(5000);
        let input = format!("\tx1\ny1\t{}\ny2\tw\n", long);
        let (resolver, matrix) = load(&input, WITH_NAMES).unwrap();
        assert_eq!(values(&resolver, &matrix.rows()[0]), [long]);
    }

    #[test]
    fn empty_cell_in_single_column_is_kept() {
        let options = LoadOptions {
            delimiter: b'\t',
            row_names: false,
        };
        let (resolver, matrix) = load("x1\na\n\"\"\nb\n", options).unwrap();
        assert_eq!(matrix.row_names(), ["1", "2", "3"]);
        assert_eq!(values(&resolver, &matrix.rows()[1]), [""]);
        assert_eq!(values(&resolver, &matrix.rows()[2]), ["b"]);

        let keys = matrix.minimal_keys();
        assert_eq!(keys["2"].len(), 1);
    }

    #[test]
    fn empty_fields_in_wider_rows_are_cells() {
        let (resolver, matrix) = load("\tx1\tx2\ny1\t\t\ny2\t1\t\n", WITH_NAMES).unwrap();
        assert_eq!(matrix.row_names(), ["y1", "y2"]);
        assert_eq!(values(&resolver, &matrix.rows()[0]), ["", ""]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = load("\tx1\tx2\ny1\t1\t2\ny2\t1\n", WITH_NAMES).unwrap_err();
        match err {
            LoadError::Matrix(MatrixError::RowLength {
                row,
                found,
                expected,
            }) => {
                assert_eq!(row, "y2");
                assert_eq!(found, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn duplicate_row_names_are_rejected() {
        let err = load("\tx1\ny1\t1\ny1\t2\n", WITH_NAMES).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Matrix(MatrixError::DuplicateRowName(ref name)) if name == "y1"
        ));
    }

    #[test]
    fn empty_input_has_no_header() {
        assert!(matches!(load("", WITH_NAMES), Err(LoadError::MissingHeader)));
    }

    #[test]
    fn invalid_utf8_reports_line() {
        let input = b"\tx1\tx2\ny1\t\xff\tb\n";
        let err = load_data::<_, Spur>(&input[..], WITH_NAMES).unwrap_err();
        assert!(matches!(err, LoadError::Utf8 { line: 2, .. }), "{:?}", err);
    }

    #[test]
    fn report_lists_keys_per_row() {
        assert_eq!(
            report("\tx1\tx2\ny1\t1\t2\ny2\t1\t3\n", WITH_NAMES),
            "y1\t{x2=2}\ny2\t{x2=3}\n"
        );
    }

    #[test]
    fn report_shows_every_minimal_key() {
        assert_eq!(
            report("\tx1\tx2\tx3\ny1\t1\t1\t1\ny2\t2\t1\t2\ny3\t3\t3\t1\n", WITH_NAMES),
            "y1\t{x1=1}\t{x2=1, x3=1}\ny2\t{x1=2}\t{x3=2}\ny3\t{x1=3}\t{x2=3}\n"
        );
    }

    #[test]
    fn report_leaves_duplicate_rows_bare() {
        assert_eq!(
            report("\tx1\ny1\ta\ny2\ta\ny3\tb\n", WITH_NAMES),
            "y1\ny2\ny3\t{x1=b}\n"
        );
    }

    #[test]
    fn delimiter_parsing() {
        assert_eq!(parse_delimiter("\t"), Ok(b'\t'));
        assert_eq!(parse_delimiter("\\t"), Ok(b'\t'));
        assert_eq!(parse_delimiter(","), Ok(b','));
        assert!(parse_delimiter(",,").is_err());
        assert!(parse_delimiter("").is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["matrix-row-keys"]).unwrap();
        let options = LoadOptions::from(&cli);
        assert_eq!(options.delimiter, b'\t');
        assert!(options.row_names);
        assert!(cli.file.is_none());

        let args = ["matrix-row-keys", "--delim", ",", "--no-row-names", "-vv", "m.csv"];
        let cli = Cli::try_parse_from(args).unwrap();
        let options = LoadOptions::from(&cli);
        assert_eq!(options.delimiter, b',');
        assert!(!options.row_names);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.file, Some(PathBuf::from("m.csv")));
    }

    #[test]
    fn verbosity_levels() {
        // Logging can only be initialized once per test process, so only the level is checked.
        let cases = [
            ((true, 0), tracing::Level::ERROR),
            ((true, 5), tracing::Level::ERROR),
            ((false, 0), tracing::Level::INFO),
            ((false, 1), tracing::Level::DEBUG),
            ((false, 2), tracing::Level::TRACE),
            ((false, 10), tracing::Level::TRACE),
        ];
        for &((quiet, verbose), expected) in cases.iter() {
            assert_eq!(
                log_level(verbose, quiet),
                expected,
                "quiet={}, verbose={}",
                quiet,
                verbose
            );
        }
    }
}
