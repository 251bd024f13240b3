use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use log::{LevelFilter, debug};
use org_rw::core::TodoState;
use org_rw::storage::{FsOrgParser, OrgParser, write_file};
use org_rw::{Document, Headline, Link, LoadOptions, TimeValue, serialize};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "org-rw",
    about = "Lossless org-mode reading, checking and rewriting",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify that every matching file under a directory round-trips unchanged.
    Check(CheckArgs),

    /// Parse and re-serialize Org files.
    Format(FormatArgs),

    /// List the links of Org files.
    Links(LinksArgs),

    /// Print the headline tree of Org files.
    Outline(OutlineArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Directory (or single file) to sweep.
    root: PathBuf,
    /// Only check files whose name contains this text.
    #[arg(long, default_value = ".org")]
    filter: String,
    /// Context lines around each hunk of a mismatch diff.
    #[arg(long, default_value_t = 10)]
    context: usize,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Fail when a file does not serialize back to its own text.
    #[arg(long)]
    cautious: bool,
}

#[derive(Debug, Args)]
struct LinksArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of one link per line.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct OutlineArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of an indented tree.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Check(args) => handle_check(args),
        Commands::Format(args) => handle_format(args).map(|()| ExitCode::SUCCESS),
        Commands::Links(args) => handle_links(args).map(|()| ExitCode::SUCCESS),
        Commands::Outline(args) => handle_outline(args).map(|()| ExitCode::SUCCESS),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/* -------------------------------- check -------------------------------- */

#[derive(Debug)]
enum CheckOutcome {
    Passed(usize),
    Failed { path: PathBuf, error: anyhow::Error },
}

fn handle_check(args: CheckArgs) -> Result<ExitCode> {
    let CheckArgs {
        root,
        filter,
        context,
    } = args;
    match check_tree(&root, &filter, context)? {
        CheckOutcome::Passed(count) => {
            println!("[OK] Check passed on {count} files");
            Ok(ExitCode::SUCCESS)
        }
        CheckOutcome::Failed { path, error } => {
            println!("== On {}", path.display());
            println!("{error:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Parse every matching file cautiously, stopping at the first failure.
fn check_tree(root: &Path, filter: &str, context: usize) -> Result<CheckOutcome> {
    let files = collect_files(root, &|path: &Path| {
        path.file_name()
            .is_some_and(|name| name.to_string_lossy().contains(filter))
    })?;
    let parser = FsOrgParser {
        options: LoadOptions {
            extra_cautious: true,
            diff_context: context,
            ..LoadOptions::default()
        },
    };
    for path in &files {
        debug!("Checking {:?}", path);
        if let Err(err) = parser.parse_file(path) {
            return Ok(CheckOutcome::Failed {
                path: path.clone(),
                error: anyhow::Error::new(err),
            });
        }
    }
    Ok(CheckOutcome::Passed(files.len()))
}

/* -------------------------------- format -------------------------------- */

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs {
        inputs,
        in_place,
        cautious,
    } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let parser = FsOrgParser {
        options: LoadOptions {
            extra_cautious: cautious,
            ..LoadOptions::default()
        },
    };
    let mut first = true;

    for path in expanded {
        debug!("Formatting {:?}", path);
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;

        if in_place {
            write_file(&path, &doc).with_context(|| format!("writing {:?}", path))?;
        } else {
            let formatted = serialize(&doc);
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }

    Ok(())
}

/* --------------------------------- links --------------------------------- */

fn handle_links(args: LinksArgs) -> Result<()> {
    let LinksArgs { inputs, json } = args;
    let parsed = parse_inputs(&inputs)?;

    if json {
        #[derive(Serialize)]
        struct JsonOutput {
            path: String,
            links: Vec<Link>,
        }

        let payload: Vec<JsonOutput> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                links: doc.links(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, doc) in &parsed {
            for link in doc.links() {
                match link.description() {
                    Some(description) => println!(
                        "{}\t{}\t{}",
                        path.display(),
                        link.value(),
                        description.replace('\n', " ")
                    ),
                    None => println!("{}\t{}", path.display(), link.value()),
                }
            }
        }
    }
    Ok(())
}

/* -------------------------------- outline -------------------------------- */

#[derive(Debug, Serialize)]
struct OutlineNode<'a> {
    line: usize,
    depth: usize,
    title: String,
    state: Option<&'a TodoState>,
    tags: Vec<String>,
    scheduled: Option<&'a TimeValue>,
    closed: Option<&'a TimeValue>,
    deadline: Option<&'a TimeValue>,
    /// Keys in source order; a repeated key keeps its first value.
    properties: IndexMap<&'a str, String>,
    children: Vec<OutlineNode<'a>>,
}

impl<'a> OutlineNode<'a> {
    fn from_headline(headline: &'a Headline) -> Self {
        let mut properties = IndexMap::new();
        for property in &headline.section.properties {
            properties
                .entry(property.key.as_str())
                .or_insert_with(|| property.value.to_string());
        }
        Self {
            line: headline.start_line,
            depth: headline.depth,
            title: headline.title_text(),
            state: headline.state.as_ref(),
            tags: headline.tags(),
            scheduled: headline.scheduled(),
            closed: headline.closed(),
            deadline: headline.deadline(),
            properties,
            children: headline.children.iter().map(Self::from_headline).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutlineFile<'a> {
    path: String,
    title: Option<&'a str>,
    id: Option<&'a str>,
    headlines: Vec<OutlineNode<'a>>,
}

fn outline<'a>(path: &Path, doc: &'a Document) -> OutlineFile<'a> {
    OutlineFile {
        path: path.display().to_string(),
        title: doc.get_keyword("TITLE"),
        id: doc.id(),
        headlines: doc.headlines.iter().map(OutlineNode::from_headline).collect(),
    }
}

fn handle_outline(args: OutlineArgs) -> Result<()> {
    let OutlineArgs { inputs, json } = args;
    let parsed = parse_inputs(&inputs)?;

    if json {
        let payload: Vec<OutlineFile<'_>> = parsed
            .iter()
            .map(|(path, doc)| outline(path, doc))
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (idx, (path, doc)) in parsed.iter().enumerate() {
        if parsed.len() > 1 {
            println!("== {} ==", path.display());
        }
        for headline in doc.all_headlines() {
            let indent = "  ".repeat(headline.depth.saturating_sub(1));
            let state = headline
                .state
                .as_ref()
                .map(|s| format!("{} ", s.keyword))
                .unwrap_or_default();
            let tags = if headline.shallow_tags().is_empty() {
                String::new()
            } else {
                format!(" :{}:", headline.shallow_tags().join(":"))
            };
            println!("{indent}{state}{}{tags}", headline.title_text());
        }
        if parsed.len() > 1 && idx + 1 < parsed.len() {
            println!();
        }
    }
    Ok(())
}

/* --------------------------------- inputs --------------------------------- */

fn parse_inputs(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, Document)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    let parser = FsOrgParser::default();
    let mut parsed = Vec::new();
    for path in expanded {
        debug!("Parsing {:?}", path);
        let doc = parser
            .parse_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, doc));
    }
    Ok(parsed)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("Scanning directory {:?}", canonical);
            for file in collect_files(&canonical, &is_org_file)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            debug!("Adding file {:?}", canonical);
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

/// Files under `dir` accepted by `keep`, sorted. Symlinks are not followed.
fn collect_files(dir: &Path, keep: &dyn Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited, keep)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    keep: &dyn Fn(&Path) -> bool,
) -> Result<()> {
    let canonical = fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)
        .with_context(|| format!("reading metadata for {:?}", canonical))?;
    if metadata.is_dir() {
        debug!("Visiting directory {:?}", canonical);
        for entry in fs::read_dir(&canonical).with_context(|| format!("listing {:?}", canonical))? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited, keep)?;
        }
    } else if metadata.is_file() && keep(&canonical) {
        debug!("Found file {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, text).expect("write");
    }

    #[test]
    fn check_passes_on_a_clean_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("a.org"), "#+TITLE: A\n\n* TODO Task :work:\nSCHEDULED: <2024-03-01 Fri>\n");
        write(&root.join("nested/b.org"), "* B\n- [ ] item\n| x | y |\n");
        write(&root.join("notes.txt"), "* not org\n");

        let outcome = check_tree(root, ".org", 10).expect("check");
        assert!(matches!(outcome, CheckOutcome::Passed(2)), "{outcome:?}");
    }

    #[test]
    fn check_stops_at_the_first_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("a.org"), "* fine\n");
        write(
            &root.join("b.org"),
            "* broken\n:PROPERTIES:\n:SPAN: <2024-01-01>--<not a date>\n:END:\n",
        );
        write(&root.join("c.org"), "* never reached\n");

        let outcome = check_tree(root, ".org", 3).expect("check");
        let CheckOutcome::Failed { path, error } = outcome else {
            panic!("expected a failure, got {outcome:?}");
        };
        assert_eq!(path, fs::canonicalize(root.join("b.org")).expect("canonical"));
        assert!(format!("{error:?}").contains("malformed time range"));
    }

    #[test]
    fn check_filter_matches_file_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("journal-2024.org"), "* day\n");
        write(&root.join("inbox.org"), "* inbox\n");

        let outcome = check_tree(root, "journal", 10).expect("check");
        assert!(matches!(outcome, CheckOutcome::Passed(1)), "{outcome:?}");
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let text = tmp.path().join("readme.md");
        write(&text, "# hi\n");
        let err = expand_inputs(&[text]).expect_err("not org");
        assert!(err.to_string().contains("is not an .org file"));
    }

    #[test]
    fn expand_inputs_walks_directories_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("x/one.org"), "* one\n");
        write(&root.join("two.org"), "* two\n");

        let files = expand_inputs(&[root.to_path_buf(), root.join("two.org")]).expect("expand");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| is_org_file(f)));
    }

    #[test]
    fn outline_keeps_first_property_value() {
        let doc = org_rw::parse(
            "* TODO Task :a:\n:PROPERTIES:\n:ID: first\n:ID: second\n:EFFORT: 1:00\n:END:\n** Child",
            false,
        )
        .expect("parse");
        let file = outline(Path::new("task.org"), &doc);
        let task = &file.headlines[0];
        assert_eq!(
            task.properties.iter().map(|(k, v)| (*k, v.as_str())).collect::<Vec<_>>(),
            [("ID", "first"), ("EFFORT", "1:00")]
        );
        assert_eq!(task.children[0].tags, ["a"]);

        let json = serde_json::to_value(&file).expect("json");
        assert_eq!(json["headlines"][0]["state"]["keyword"], "TODO");
        assert_eq!(json["headlines"][0]["properties"]["ID"], "first");
    }
}
