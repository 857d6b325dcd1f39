// Assembler core pipeline: classification, two-pass translation, CLI.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use serde_json::json;

use crate::blocks::{BlockFrame, BlockKind, BlockStack};
use crate::encoder::{self, AluOp, BranchCond, Encoder};
use crate::preprocess::{LineRecord, Preprocessor};
use crate::symbols::{SymbolTable, SymbolTableResult};
use crate::value;

pub const VERSION: &str = "1.0";
const LONG_ABOUT: &str = "MULTIX assembler producing little-endian RV64I machine code.

Outputs are opt-in: specify at least one of -l/--list, -x/--hex, -b/--bin,
or --labels. Use -o/--outfile to set the output base name when filenames are
omitted. With multiple inputs, -o must be a directory and explicit output
filenames are not allowed.";

#[derive(Parser, Debug)]
#[command(
    name = "msa",
    version = VERSION,
    about = "MULTIX assembler targeting RV64I",
    long_about = LONG_ABOUT
)]
struct Cli {
    #[arg(
        short = 'l',
        long = "list",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit a trace listing file. FILE is optional; when omitted, the output base is used and a .lst extension is added."
    )]
    list_name: Option<String>,
    #[arg(
        short = 'x',
        long = "hex",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit the console hex form: uppercase bytes, space separated, sixteen to a line. FILE is optional; when omitted, the output base is used and a .hex extension is added."
    )]
    hex_name: Option<String>,
    #[arg(
        short = 'b',
        long = "bin",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit the raw little-endian binary image. FILE is optional; when omitted, the output base is used and a .bin extension is added."
    )]
    bin_name: Option<String>,
    #[arg(
        long = "labels",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit the symbol table as JSON. FILE is optional; when omitted, the output base is used and a .json extension is added."
    )]
    labels_name: Option<String>,
    #[arg(
        short = 'o',
        long = "outfile",
        value_name = "BASE",
        long_help = "Output filename base when output flags omit filenames. Defaults to the input base. With multiple inputs, BASE must be a directory."
    )]
    outfile: Option<String>,
    #[arg(
        short = 'i',
        long = "infile",
        value_name = "FILE",
        action = ArgAction::Append,
        long_help = "Input MULTIX file (repeatable). Must end with .mx."
    )]
    infiles: Vec<PathBuf>,
}

pub fn run() -> Result<Vec<AsmRunReport>, AsmRunError> {
    let cli = Cli::parse();
    run_with_cli(&cli)
}

fn cli_error(msg: &str) -> AsmRunError {
    AsmRunError::new(
        AsmError::new(AsmErrorKind::Cli, msg, None),
        Vec::new(),
        Vec::new(),
    )
}

fn run_with_cli(cli: &Cli) -> Result<Vec<AsmRunReport>, AsmRunError> {
    if cli.infiles.is_empty() {
        return Err(cli_error("No input files specified. Use -i/--infile"));
    }

    let any_output = cli.list_name.is_some()
        || cli.hex_name.is_some()
        || cli.bin_name.is_some()
        || cli.labels_name.is_some();
    if !any_output {
        return Err(cli_error(
            "No outputs selected. Specify at least one of -l/--list, -x/--hex, -b/--bin, or --labels",
        ));
    }

    if cli.infiles.len() > 1 {
        let named = [
            ("-l/--list", &cli.list_name),
            ("-x/--hex", &cli.hex_name),
            ("-b/--bin", &cli.bin_name),
            ("--labels", &cli.labels_name),
        ];
        for (flag, name) in named {
            if name.as_deref().is_some_and(|n| !n.is_empty()) {
                return Err(cli_error(&format!(
                    "Explicit {flag} filenames are not allowed with multiple inputs"
                )));
            }
        }
    }

    let out_dir = if cli.infiles.len() > 1 {
        match cli.outfile.as_deref() {
            Some(out) => {
                let out_path = PathBuf::from(out);
                if out_path.exists() && !out_path.is_dir() {
                    return Err(cli_error(
                        "-o/--outfile must be a directory when multiple inputs are provided",
                    ));
                }
                if let Err(err) = fs::create_dir_all(&out_path) {
                    return Err(AsmRunError::new(
                        AsmError::new(AsmErrorKind::Io, &err.to_string(), Some(out)),
                        Vec::new(),
                        Vec::new(),
                    ));
                }
                Some(out_path)
            }
            None => None,
        }
    } else {
        None
    };

    let mut reports = Vec::new();
    for asm_path in &cli.infiles {
        let (asm_name, input_base) = input_base_from_path(asm_path)?;
        let out_base = if let Some(dir) = &out_dir {
            dir.join(&input_base).to_string_lossy().to_string()
        } else {
            cli.outfile.as_deref().unwrap_or(&input_base).to_string()
        };
        reports.push(run_one(cli, &asm_name, &out_base)?);
    }
    Ok(reports)
}

fn run_one(cli: &Cli, asm_name: &str, out_base: &str) -> Result<AsmRunReport, AsmRunError> {
    let source = fs::read_to_string(asm_name).map_err(|err| {
        AsmRunError::new(
            AsmError::new(AsmErrorKind::Io, &err.to_string(), Some(asm_name)),
            Vec::new(),
            Vec::new(),
        )
    })?;
    let source_lines: Vec<String> = source.lines().map(|s| s.to_string()).collect();

    let mut assembler = Assembler::new();
    let bytes = assembler.compile(&source)?;

    if let Some(path) = resolve_output_path(out_base, cli.list_name.clone(), "lst") {
        let mut file = File::create(&path).map_err(|_| {
            io_run_error(&mut assembler, &source_lines, "Error opening file for write", &path)
        })?;
        let mut listing = ListingWriter::new(&mut file);
        let mut listed = listing.header();
        if listed.is_ok() {
            listed = listing.write_trace(assembler.trace());
        }
        if listed.is_ok() {
            listed = listing.footer(assembler.counts(), assembler.symbols(), bytes.len());
        }
        if let Err(err) = listed {
            return Err(io_run_error(
                &mut assembler,
                &source_lines,
                &err.to_string(),
                &path,
            ));
        }
    }

    if let Some(path) = resolve_output_path(out_base, cli.hex_name.clone(), "hex") {
        let mut text = encoder::hex_dump(&bytes);
        text.push('\n');
        fs::write(&path, text).map_err(|err| {
            io_run_error(&mut assembler, &source_lines, &err.to_string(), &path)
        })?;
    }

    if let Some(path) = resolve_output_path(out_base, cli.bin_name.clone(), "bin") {
        fs::write(&path, &bytes).map_err(|err| {
            io_run_error(&mut assembler, &source_lines, &err.to_string(), &path)
        })?;
    }

    if let Some(path) = resolve_output_path(out_base, cli.labels_name.clone(), "json") {
        emit_labels_file(Path::new(&path), assembler.symbols()).map_err(|err| {
            io_run_error(&mut assembler, &source_lines, &err.to_string(), &path)
        })?;
    }

    Ok(AsmRunReport::new(assembler.take_diagnostics(), source_lines))
}

fn io_run_error(
    assembler: &mut Assembler,
    source_lines: &[String],
    msg: &str,
    path: &str,
) -> AsmRunError {
    AsmRunError::new(
        AsmError::new(AsmErrorKind::Io, msg, Some(path)),
        assembler.take_diagnostics(),
        source_lines.to_vec(),
    )
}

/// Write the symbol table as a JSON labels file.
fn emit_labels_file(path: &Path, symbols: &SymbolTable) -> io::Result<()> {
    let mut entries = symbols.entries();
    entries.sort_by(|left, right| {
        left.name
            .to_ascii_lowercase()
            .cmp(&right.name.to_ascii_lowercase())
    });
    let labels: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|entry| {
            json!({
                "name": entry.name,
                "address": format!("{:08X}", entry.val),
                "value": entry.val,
                "kind": if entry.is_label { "label" } else { "constant" },
            })
        })
        .collect();
    fs::write(path, json!({ "labels": labels }).to_string())
}

fn input_base_from_path(path: &PathBuf) -> Result<(String, String), AsmRunError> {
    let asm_name = path.to_string_lossy().to_string();
    let file_name = match path.file_name().and_then(|s| s.to_str()) {
        Some(name) => name,
        None => return Err(cli_error("Invalid input file name")),
    };
    if !file_name.ends_with(".mx") {
        return Err(cli_error("Input file must end with .mx"));
    }
    let base = file_name.strip_suffix(".mx").unwrap_or(file_name);
    Ok((asm_name, base.to_string()))
}

fn resolve_output_path(base: &str, name: Option<String>, extension: &str) -> Option<String> {
    let name = name?;
    if name.is_empty() {
        return Some(format!("{base}.{extension}"));
    }
    let mut path = PathBuf::from(&name);
    if path.extension().is_none() {
        path = PathBuf::from(format!("{name}.{extension}"));
    }
    Some(path.to_string_lossy().to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassCounts {
    pub lines: u32,
    pub errors: u32,
    pub warnings: u32,
}

impl PassCounts {
    fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmErrorKind {
    Assembler,
    Cli,
    Condition,
    Internal,
    Io,
    Loop,
    Register,
    Symbol,
    Syntax,
    Value,
}

#[derive(Debug, Clone)]
pub struct AsmError {
    kind: AsmErrorKind,
    message: String,
    param: Option<String>,
}

impl AsmError {
    fn new(kind: AsmErrorKind, msg: &str, param: Option<&str>) -> Self {
        Self {
            kind,
            message: format_error(msg, param),
            param: param.map(|p| p.to_string()),
        }
    }

    pub fn kind(&self) -> AsmErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AsmError {}

fn format_error(msg: &str, param: Option<&str>) -> String {
    match param {
        Some(p) => format!("{msg}: {p}"),
        None => msg.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    line: u32,
    column: Option<usize>,
    severity: Severity,
    error: AsmError,
}

impl Diagnostic {
    fn new(line: u32, severity: Severity, error: AsmError) -> Self {
        Self {
            line,
            column: None,
            severity,
            error,
        }
    }

    fn with_column(mut self, column: Option<usize>) -> Self {
        self.column = column;
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn error(&self) -> &AsmError {
        &self.error
    }

    pub fn format(&self) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        format!("{}: {} - {}", self.line, sev, self.error.message())
    }

    pub fn format_with_context(&self, lines: Option<&[String]>, use_color: bool) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        let mut out = String::new();
        out.push_str(&format!("{}: {sev}\n", self.line));
        for line in build_context_lines(self.line, self.column, lines, use_color) {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!("{sev}: {}", self.error.message()));
        out
    }
}

#[derive(Debug)]
pub struct AsmRunReport {
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
}

impl AsmRunReport {
    fn new(diagnostics: Vec<Diagnostic>, source_lines: Vec<String>) -> Self {
        Self {
            diagnostics,
            source_lines,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }
}

#[derive(Debug)]
pub struct AsmRunError {
    error: AsmError,
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
}

impl AsmRunError {
    fn new(error: AsmError, diagnostics: Vec<Diagnostic>, source_lines: Vec<String>) -> Self {
        Self {
            error,
            diagnostics,
            source_lines,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }
}

impl fmt::Display for AsmRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for AsmRunError {}

fn build_context_lines(
    line_num: u32,
    column: Option<usize>,
    lines: Option<&[String]>,
    use_color: bool,
) -> Vec<String> {
    let mut out = Vec::new();
    let line_idx = line_num.saturating_sub(1) as usize;
    let lines = match lines {
        Some(lines) if line_idx < lines.len() => lines,
        _ => {
            out.push(format!("{:>5} | <source unavailable>", line_num));
            return out;
        }
    };
    let display = highlight_line(&lines[line_idx], column, use_color);
    out.push(format!("{:>5} | {}", line_num, display));
    out
}

fn highlight_line(line: &str, column: Option<usize>, use_color: bool) -> String {
    let col = match column {
        Some(c) if c > 0 => c,
        _ => return line.to_string(),
    };
    let idx = col - 1;
    if idx >= line.len() {
        if use_color {
            return format!("{line}\x1b[31m^\x1b[0m");
        }
        return format!("{line}^");
    }
    let (head, tail) = line.split_at(idx);
    let ch = tail.chars().next().unwrap_or(' ');
    let rest = &tail[ch.len_utf8()..];
    if use_color {
        format!("{head}\x1b[31m{ch}\x1b[0m{rest}")
    } else {
        format!("{head}{ch}{rest}")
    }
}

/// Addressing mode of a `[…]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrMode {
    Plain,
    PostInc,
    PreDec,
}

fn parse_bracket(token: &str) -> Option<(AddrMode, &str)> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    if let Some(reg) = inner.strip_prefix("--") {
        return Some((AddrMode::PreDec, reg));
    }
    if let Some(reg) = inner.strip_suffix("++") {
        return Some((AddrMode::PostInc, reg));
    }
    Some((AddrMode::Plain, inner))
}

fn parse_reg(token: &str) -> Result<u8, AsmError> {
    if let Some(digits) = token.strip_prefix('x') {
        if !digits.is_empty() && digits.len() <= 2 && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(num) = digits.parse::<u8>() {
                if num < 32 {
                    return Ok(num);
                }
            }
        }
    }
    Err(AsmError::new(
        AsmErrorKind::Register,
        "Unknown register",
        Some(token),
    ))
}

/// True for `x` followed by digits, whether or not it names a real
/// register. Distinguishes a botched register (`x32`) from a plain
/// identifier in an unrecognized shape.
fn looks_like_register(token: &str) -> bool {
    token
        .strip_prefix('x')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn is_ident(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Source comparison operator of a `&`/`?` opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondOp {
    Lt,
    Gt,
    Eq,
    Ne,
    Le,
    Ge,
}

impl CondOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "<" => Some(CondOp::Lt),
            ">" => Some(CondOp::Gt),
            "==" => Some(CondOp::Eq),
            "!=" => Some(CondOp::Ne),
            "<=" => Some(CondOp::Le),
            ">=" => Some(CondOp::Ge),
            _ => None,
        }
    }

    /// Branch that skips past the block when the source condition is
    /// false. `<=` and `>` invert through swapped operands.
    fn skip_branch(self) -> (BranchCond, bool) {
        match self {
            CondOp::Lt => (BranchCond::Ge, false),
            CondOp::Ge => (BranchCond::Lt, false),
            CondOp::Eq => (BranchCond::Ne, false),
            CondOp::Ne => (BranchCond::Eq, false),
            CondOp::Le => (BranchCond::Lt, true),
            CondOp::Gt => (BranchCond::Ge, true),
        }
    }
}

/// Classified source line. Classification is shared verbatim between the
/// passes so byte costs cannot diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineKind {
    ConstDef { name: String, value: String },
    Entry { value: Option<String> },
    Label { name: String },
    Halt,
    Return { ptr: u8 },
    Call { target: String, ptr: u8 },
    Break,
    Continue,
    RangeOpen { rd: u8, rsrc: u8, rend: u8, step: Option<String> },
    WhileOpen { rs1: u8, op: CondOp, rs2: u8 },
    IfOpen { rs1: u8, op: CondOp, rs2: u8 },
    StorePreDec { ptr: u8, src: u8 },
    Store { ptr: u8, src: u8 },
    LoadPostInc { rd: u8, ptr: u8 },
    Load { rd: u8, ptr: u8 },
    Arith { rd: u8, lhs: String, op: AluOp, rhs: String },
    Move { rd: u8, src: String },
    Jump { target: String },
}

/// Byte contribution of a classified line. The authoritative costs; pass 1
/// advances pc by them and pass 2 checks emission against them.
fn line_cost(kind: &LineKind) -> u64 {
    match kind {
        LineKind::ConstDef { .. } | LineKind::Entry { .. } | LineKind::Label { .. } => 0,
        LineKind::Halt
        | LineKind::Break
        | LineKind::Continue
        | LineKind::Jump { .. }
        | LineKind::WhileOpen { .. }
        | LineKind::IfOpen { .. }
        | LineKind::Store { .. }
        | LineKind::Load { .. }
        | LineKind::Arith { .. }
        | LineKind::Move { .. } => 4,
        LineKind::RangeOpen { .. }
        | LineKind::StorePreDec { .. }
        | LineKind::LoadPostInc { .. } => 8,
        LineKind::Return { .. } => 12,
        LineKind::Call { .. } => 20,
    }
}

/// Byte contribution of closing a block.
fn close_cost(kind: BlockKind) -> u64 {
    match kind {
        BlockKind::While => 4,
        BlockKind::Range => 8,
        BlockKind::If => 0,
    }
}

fn syntax_error(msg: &str, param: &str) -> AsmError {
    AsmError::new(AsmErrorKind::Syntax, msg, Some(param))
}

fn parse_condition(tokens: &[&str]) -> Result<(u8, CondOp, u8), AsmError> {
    if tokens.len() != 4 {
        return Err(AsmError::new(
            AsmErrorKind::Condition,
            "Conditional must be register-operator-register",
            Some(tokens[0]),
        ));
    }
    let op = CondOp::parse(tokens[2]).ok_or_else(|| {
        AsmError::new(
            AsmErrorKind::Condition,
            "Invalid operator in conditional",
            Some(tokens[2]),
        )
    })?;
    Ok((parse_reg(tokens[1])?, op, parse_reg(tokens[3])?))
}

fn classify(tokens: &[&str], in_code: bool) -> Result<LineKind, AsmError> {
    let first = tokens[0];

    if first == ":" {
        if tokens.len() > 2 {
            return Err(syntax_error("Expecting end of line, found", tokens[2]));
        }
        return Ok(LineKind::Entry {
            value: tokens.get(1).map(|t| t.to_string()),
        });
    }
    if first == "_" && tokens.len() == 1 {
        return Ok(LineKind::Halt);
    }
    if first == "." && tokens.len() == 1 {
        return Ok(LineKind::Break);
    }
    if first == ".." && tokens.len() == 1 {
        return Ok(LineKind::Continue);
    }
    if first == "=" {
        if tokens.len() == 2 {
            if let Some((AddrMode::PostInc, reg)) = parse_bracket(tokens[1]) {
                return Ok(LineKind::Return {
                    ptr: parse_reg(reg)?,
                });
            }
        }
        return Err(syntax_error(
            "Return must be of the form '= [reg++]', found",
            tokens.get(1).copied().unwrap_or("="),
        ));
    }
    if first == "&" {
        let is_range = tokens.len() >= 4 && CondOp::parse(tokens[2]).is_none();
        if is_range {
            if tokens.len() > 5 {
                return Err(syntax_error("Expecting end of line, found", tokens[5]));
            }
            return Ok(LineKind::RangeOpen {
                rd: parse_reg(tokens[1])?,
                rsrc: parse_reg(tokens[2])?,
                rend: parse_reg(tokens[3])?,
                step: tokens.get(4).map(|t| t.to_string()),
            });
        }
        let (rs1, op, rs2) = parse_condition(tokens)?;
        return Ok(LineKind::WhileOpen { rs1, op, rs2 });
    }
    if first == "?" {
        let (rs1, op, rs2) = parse_condition(tokens)?;
        return Ok(LineKind::IfOpen { rs1, op, rs2 });
    }

    if let Some((mode, reg)) = parse_bracket(first) {
        if tokens.len() != 2 {
            return Err(syntax_error("Store needs a single source register, found", first));
        }
        let ptr = parse_reg(reg)?;
        let src = parse_reg(tokens[1])?;
        return match mode {
            AddrMode::Plain => Ok(LineKind::Store { ptr, src }),
            AddrMode::PreDec => Ok(LineKind::StorePreDec { ptr, src }),
            AddrMode::PostInc => Err(syntax_error("Post-increment is not a store form", first)),
        };
    }

    let first_is_reg = parse_reg(first).is_ok();

    if tokens.len() == 1 {
        if let Some(name) = first.strip_suffix(':') {
            if is_ident(name) && parse_reg(name).is_err() {
                return Ok(LineKind::Label {
                    name: name.to_string(),
                });
            }
        }
        if is_ident(first) && !first_is_reg {
            return Ok(LineKind::Jump {
                target: first.to_string(),
            });
        }
        return Err(syntax_error("Unrecognized statement", first));
    }

    if tokens.len() == 2 {
        if tokens[1] == ":" && is_ident(first) && !first_is_reg {
            return Ok(LineKind::Label {
                name: first.to_string(),
            });
        }
        if !first_is_reg && is_ident(first) {
            if let Some((AddrMode::PreDec, reg)) = parse_bracket(tokens[1]) {
                return Ok(LineKind::Call {
                    target: first.to_string(),
                    ptr: parse_reg(reg)?,
                });
            }
            if !tokens[1].starts_with('[') {
                if !in_code {
                    return Ok(LineKind::ConstDef {
                        name: first.to_string(),
                        value: tokens[1].to_string(),
                    });
                }
                if !looks_like_register(first) {
                    return Err(syntax_error("Unrecognized statement", first));
                }
            }
        }
        // Load and move forms put the destination in a register position.
        let rd = parse_reg(first)?;
        if let Some((mode, reg)) = parse_bracket(tokens[1]) {
            let ptr = parse_reg(reg)?;
            return match mode {
                AddrMode::Plain => Ok(LineKind::Load { rd, ptr }),
                AddrMode::PostInc => Ok(LineKind::LoadPostInc { rd, ptr }),
                AddrMode::PreDec => {
                    Err(syntax_error("Pre-decrement is not a load form", tokens[1]))
                }
            };
        }
        return Ok(LineKind::Move {
            rd,
            src: tokens[1].to_string(),
        });
    }

    if tokens.len() == 4 {
        if let Some(op) = AluOp::from_symbol(tokens[2]) {
            let rd = parse_reg(first)?;
            return Ok(LineKind::Arith {
                rd,
                lhs: tokens[1].to_string(),
                op,
                rhs: tokens[3].to_string(),
            });
        }
        if first_is_reg {
            return Err(syntax_error("Unknown arithmetic operator", tokens[2]));
        }
    }

    Err(syntax_error("Unrecognized statement", first))
}

/// Per-pass walk state. The block stack and the auto-label counter are
/// reset for each pass and advance in lock-step between them.
struct PassState {
    blocks: BlockStack,
    next_block_id: u32,
    pc: u64,
    in_code: bool,
}

impl PassState {
    fn new() -> Self {
        Self {
            blocks: BlockStack::new(),
            next_block_id: 0,
            pc: 0,
            in_code: false,
        }
    }

    fn open(&mut self, kind: BlockKind, indent: usize, iter_reg: u8, step: i64) -> BlockFrame {
        let id = self.next_block_id;
        self.next_block_id += 1;
        BlockFrame {
            kind,
            indent,
            start_label: format!("_B_START_{id}"),
            end_label: format!("_B_END_{id}"),
            iter_reg,
            step,
        }
    }
}

/// Two-pass MULTIX → RV64I assembler.
///
/// One instance can compile multiple sources serially; every `compile`
/// starts by resetting all state from the previous run.
pub struct Assembler {
    symbols: SymbolTable,
    encoder: Encoder,
    diagnostics: Vec<Diagnostic>,
    counts: PassCounts,
    origin: u64,
    final_pc: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            encoder: Encoder::new(),
            diagnostics: Vec::new(),
            counts: PassCounts::new(),
            origin: 0,
            final_pc: 0,
        }
    }

    /// Clear all state held from a previous compile.
    pub fn reset(&mut self) {
        self.symbols.clear();
        self.encoder.clear();
        self.diagnostics.clear();
        self.counts = PassCounts::new();
        self.origin = 0;
        self.final_pc = 0;
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The assembly trace of the last successful compile.
    pub fn trace(&self) -> &[String] {
        self.encoder.trace()
    }

    pub fn bytes(&self) -> &[u8] {
        self.encoder.bytes()
    }

    pub fn counts(&self) -> &PassCounts {
        &self.counts
    }

    /// Origin address set by the entry-point line.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Pass-1 final program counter.
    pub fn final_pc(&self) -> u64 {
        self.final_pc
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Compile a MULTIX source to RV64I machine code.
    ///
    /// Produces the byte vector and the trace atomically: on failure the
    /// first error is reported and no partial output escapes.
    pub fn compile(&mut self, source: &str) -> Result<Vec<u8>, AsmRunError> {
        self.reset();
        let source_lines: Vec<String> = source.lines().map(|s| s.to_string()).collect();
        let mut pp = Preprocessor::new();
        pp.process(source);
        let lines = pp.lines().to_vec();

        let pass1 = self.pass1(&lines);
        if pass1.errors > 0 {
            return Err(AsmRunError::new(
                AsmError::new(
                    AsmErrorKind::Assembler,
                    "Errors detected in source. No output generated.",
                    None,
                ),
                self.take_diagnostics(),
                source_lines,
            ));
        }

        let pass2 = self.pass2(&lines);
        if pass2.errors > 0 {
            self.encoder.clear();
            return Err(AsmRunError::new(
                AsmError::new(
                    AsmErrorKind::Assembler,
                    "Errors detected in source. No output generated.",
                    None,
                ),
                self.take_diagnostics(),
                source_lines,
            ));
        }

        self.counts = pass2;
        Ok(self.encoder.bytes().to_vec())
    }

    fn report(
        &mut self,
        line: &LineRecord,
        severity: Severity,
        err: AsmError,
        counts: &mut PassCounts,
    ) {
        let column = err
            .param()
            .and_then(|p| line.text.find(p))
            .map(|ix| line.indent + ix + 1);
        self.diagnostics
            .push(Diagnostic::new(line.line_num, severity, err).with_column(column));
        match severity {
            Severity::Error => counts.errors += 1,
            Severity::Warning => counts.warnings += 1,
        }
    }

    fn warn(&mut self, line: &LineRecord, msg: &str, param: &str, counts: &mut PassCounts) {
        let err = AsmError::new(AsmErrorKind::Value, msg, Some(param));
        self.report(line, Severity::Warning, err, counts);
    }

    fn define_constant(&mut self, name: &str, val: i64) -> Result<(), AsmError> {
        match self.symbols.add_constant(name, val) {
            SymbolTableResult::Ok => Ok(()),
            SymbolTableResult::Duplicate => Err(AsmError::new(
                AsmErrorKind::Symbol,
                "Symbol defined more than once",
                Some(name),
            )),
        }
    }

    fn define_label(&mut self, name: &str, addr: i64) -> Result<(), AsmError> {
        match self.symbols.add_label(name, addr) {
            SymbolTableResult::Ok => Ok(()),
            SymbolTableResult::Duplicate => Err(AsmError::new(
                AsmErrorKind::Symbol,
                "Symbol defined more than once",
                Some(name),
            )),
        }
    }

    fn label_addr(&self, name: &str) -> Result<i64, AsmError> {
        self.symbols.label(name).ok_or_else(|| {
            AsmError::new(AsmErrorKind::Symbol, "Label not found", Some(name))
        })
    }

    /// Single-instruction load-immediate. Returns true when the value did
    /// not survive intact (the low 12 bits, or bits above 31, were lost).
    fn load_immediate(&mut self, rd: u8, val: i64) -> bool {
        if (-2048..=2047).contains(&val) {
            self.encoder.addi(rd, 0, val);
            false
        } else {
            let imm20 = (val >> 12) & 0xfffff;
            self.encoder.lui(rd, imm20);
            let materialized = (((imm20 as u32) << 12) as i32) as i64;
            materialized != val
        }
    }

    /// Pass 1: advance the synthetic pc by each line's byte contribution
    /// and place every label, including the per-block auto-labels.
    fn pass1(&mut self, lines: &[LineRecord]) -> PassCounts {
        let mut state = PassState::new();
        let mut counts = PassCounts::new();
        for line in lines {
            counts.lines += 1;
            if let Err(err) = self.size_line(line, &mut state) {
                self.report(line, Severity::Error, err, &mut counts);
                break;
            }
        }
        if counts.errors == 0 {
            let closed = state.blocks.pop_all();
            if let Err(err) = self.size_closed(closed, &mut state) {
                let line_num = lines.last().map(|l| l.line_num).unwrap_or(0);
                self.diagnostics
                    .push(Diagnostic::new(line_num, Severity::Error, err));
                counts.errors += 1;
            }
        }
        self.final_pc = state.pc;
        counts
    }

    fn size_line(&mut self, line: &LineRecord, state: &mut PassState) -> Result<(), AsmError> {
        let closed = state.blocks.pop_closed(line.indent);
        self.size_closed(closed, state)?;

        let tokens: Vec<&str> = line.text.split_whitespace().collect();
        let kind = classify(&tokens, state.in_code)?;
        match &kind {
            LineKind::ConstDef { name, value } => {
                let val = value::resolve(value, &self.symbols);
                self.define_constant(name, val)?;
            }
            LineKind::Entry { value } => {
                let origin = match value {
                    Some(tok) => value::resolve(tok, &self.symbols),
                    None => 0,
                };
                self.origin = origin as u64;
                state.pc = self.origin;
                state.in_code = true;
                self.define_label(":", origin)?;
            }
            LineKind::Label { name } => {
                state.in_code = true;
                self.define_label(name, state.pc as i64)?;
            }
            LineKind::WhileOpen { .. } => {
                let frame = state.open(BlockKind::While, line.indent, 0, 1);
                self.define_label(&frame.start_label, state.pc as i64)?;
                state.blocks.push(frame);
            }
            LineKind::IfOpen { .. } => {
                let frame = state.open(BlockKind::If, line.indent, 0, 1);
                self.define_label(&frame.start_label, state.pc as i64)?;
                state.blocks.push(frame);
            }
            LineKind::RangeOpen { rd, step, .. } => {
                let step_val = step
                    .as_deref()
                    .map(|tok| value::resolve(tok, &self.symbols))
                    .unwrap_or(1);
                let frame = state.open(BlockKind::Range, line.indent, *rd, step_val);
                // Start label sits after the iterator-init instruction, on
                // the condition branch, so loop-back re-evaluates it.
                self.define_label(&frame.start_label, (state.pc + 4) as i64)?;
                state.blocks.push(frame);
            }
            LineKind::Break | LineKind::Continue => {
                if state.blocks.nearest_loop().is_none() {
                    return Err(AsmError::new(
                        AsmErrorKind::Loop,
                        "Break or continue outside of a loop",
                        Some(tokens[0]),
                    ));
                }
            }
            _ => {}
        }
        state.pc += line_cost(&kind);
        Ok(())
    }

    fn size_closed(
        &mut self,
        frames: Vec<BlockFrame>,
        state: &mut PassState,
    ) -> Result<(), AsmError> {
        for frame in frames {
            state.pc += close_cost(frame.kind);
            self.define_label(&frame.end_label, state.pc as i64)?;
        }
        Ok(())
    }

    /// Pass 2: re-run the identical walk and emit every primitive, checking
    /// each line's emitted size against the pass-1 cost.
    fn pass2(&mut self, lines: &[LineRecord]) -> PassCounts {
        let mut state = PassState::new();
        let mut counts = PassCounts::new();
        for line in lines {
            counts.lines += 1;
            if let Err(err) = self.emit_line(line, &mut state, &mut counts) {
                self.report(line, Severity::Error, err, &mut counts);
                break;
            }
        }
        if counts.errors == 0 {
            let closed = state.blocks.pop_all();
            if let Err(err) = self.emit_closed(closed, &mut state) {
                let line_num = lines.last().map(|l| l.line_num).unwrap_or(0);
                self.diagnostics
                    .push(Diagnostic::new(line_num, Severity::Error, err));
                counts.errors += 1;
            }
        }
        counts
    }

    fn emit_line(
        &mut self,
        line: &LineRecord,
        state: &mut PassState,
        counts: &mut PassCounts,
    ) -> Result<(), AsmError> {
        let closed = state.blocks.pop_closed(line.indent);
        self.emit_closed(closed, state)?;

        let tokens: Vec<&str> = line.text.split_whitespace().collect();
        let kind = classify(&tokens, state.in_code)?;
        self.encoder.comment(&line.text);
        let before = self.encoder.len() as u64;
        let pc = state.pc;

        match &kind {
            LineKind::ConstDef { .. } => {}
            LineKind::Entry { .. } => {
                state.pc = self.origin;
                state.in_code = true;
            }
            LineKind::Label { .. } => state.in_code = true,
            LineKind::Halt => self.encoder.jal(0, 0),
            LineKind::Return { ptr } => {
                self.encoder.ld(1, *ptr, 0);
                self.encoder.addi(*ptr, *ptr, 8);
                self.encoder.jalr(0, 1, 0);
            }
            LineKind::Call { target, ptr } => {
                let target_addr = self.label_addr(target)?;
                // x1 carries the return address between the pc capture and
                // the store; the jump is the fifth primitive, at pc + 16.
                self.encoder.auipc(1, 0);
                self.encoder.addi(1, 1, 20);
                self.encoder.addi(*ptr, *ptr, -8);
                self.encoder.sd(1, *ptr, 0);
                self.encoder.jal(0, target_addr - (pc + 16) as i64);
            }
            LineKind::Break => {
                let frame = state.blocks.nearest_loop().ok_or_else(|| {
                    AsmError::new(
                        AsmErrorKind::Loop,
                        "Break or continue outside of a loop",
                        Some(tokens[0]),
                    )
                })?;
                let addr = self.label_addr(&frame.end_label)?;
                self.encoder.jal(0, addr - pc as i64);
            }
            LineKind::Continue => {
                let frame = state.blocks.nearest_loop().ok_or_else(|| {
                    AsmError::new(
                        AsmErrorKind::Loop,
                        "Break or continue outside of a loop",
                        Some(tokens[0]),
                    )
                })?;
                let addr = self.label_addr(&frame.start_label)?;
                self.encoder.jal(0, addr - pc as i64);
            }
            LineKind::WhileOpen { rs1, op, rs2 } | LineKind::IfOpen { rs1, op, rs2 } => {
                let block_kind = if matches!(kind, LineKind::WhileOpen { .. }) {
                    BlockKind::While
                } else {
                    BlockKind::If
                };
                let frame = state.open(block_kind, line.indent, 0, 1);
                let end_addr = self.label_addr(&frame.end_label)?;
                let (cond, swap) = op.skip_branch();
                let (a, b) = if swap { (*rs2, *rs1) } else { (*rs1, *rs2) };
                self.encoder.branch(cond, a, b, end_addr - pc as i64);
                state.blocks.push(frame);
            }
            LineKind::RangeOpen { rd, rsrc, rend, step } => {
                let step_val = step
                    .as_deref()
                    .map(|tok| value::resolve(tok, &self.symbols))
                    .unwrap_or(1);
                let frame = state.open(BlockKind::Range, line.indent, *rd, step_val);
                let end_addr = self.label_addr(&frame.end_label)?;
                self.encoder.addi(*rd, *rsrc, 0);
                self.encoder
                    .branch(BranchCond::Ge, *rd, *rend, end_addr - (pc + 4) as i64);
                state.blocks.push(frame);
            }
            LineKind::StorePreDec { ptr, src } => {
                self.encoder.addi(*ptr, *ptr, -8);
                self.encoder.sd(*src, *ptr, 0);
            }
            LineKind::Store { ptr, src } => self.encoder.sd(*src, *ptr, 0),
            LineKind::LoadPostInc { rd, ptr } => {
                self.encoder.ld(*rd, *ptr, 0);
                self.encoder.addi(*ptr, *ptr, 8);
            }
            LineKind::Load { rd, ptr } => self.encoder.ld(*rd, *ptr, 0),
            LineKind::Arith { rd, lhs, op, rhs } => {
                match (parse_reg(lhs), parse_reg(rhs)) {
                    (Ok(r1), Ok(r2)) => self.encoder.alu_reg(*op, *rd, r1, r2),
                    (Ok(r1), Err(_)) => {
                        let imm = value::resolve(rhs, &self.symbols);
                        self.encoder.alu_imm(*op, *rd, r1, imm);
                    }
                    _ => {
                        let folded = op.fold(
                            value::resolve(lhs, &self.symbols),
                            value::resolve(rhs, &self.symbols),
                        );
                        if self.load_immediate(*rd, folded) {
                            self.warn(line, "Value truncated to upper 20 bits", &line.text, counts);
                        }
                    }
                }
            }
            LineKind::Move { rd, src } => match parse_reg(src) {
                Ok(rs) => self.encoder.addi(*rd, rs, 0),
                Err(_) => {
                    let val = value::resolve(src, &self.symbols);
                    if self.load_immediate(*rd, val) {
                        self.warn(line, "Value truncated to upper 20 bits", src, counts);
                    }
                }
            },
            LineKind::Jump { target } => {
                let addr = self.label_addr(target)?;
                self.encoder.jal(0, addr - pc as i64);
            }
        }

        let emitted = self.encoder.len() as u64 - before;
        let cost = line_cost(&kind);
        if emitted != cost {
            return Err(AsmError::new(
                AsmErrorKind::Internal,
                "Sizing and emission disagree on line cost",
                Some(&line.text),
            ));
        }
        state.pc += cost;
        Ok(())
    }

    fn emit_closed(
        &mut self,
        frames: Vec<BlockFrame>,
        state: &mut PassState,
    ) -> Result<(), AsmError> {
        for frame in frames {
            self.encoder
                .comment(&format!("--- End of Block {} ---", frame.start_label));
            match frame.kind {
                BlockKind::While => {
                    let start = self.label_addr(&frame.start_label)?;
                    self.encoder.jal(0, start - state.pc as i64);
                }
                BlockKind::Range => {
                    let start = self.label_addr(&frame.start_label)?;
                    self.encoder.addi(frame.iter_reg, frame.iter_reg, frame.step);
                    self.encoder.jal(0, start - (state.pc + 4) as i64);
                }
                BlockKind::If => {}
            }
            state.pc += close_cost(frame.kind);
        }
        Ok(())
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

struct ListingWriter<W: Write> {
    out: W,
}

impl<W: Write> ListingWriter<W> {
    fn new(out: W) -> Self {
        Self { out }
    }

    fn header(&mut self) -> io::Result<()> {
        writeln!(self.out, "msa MULTIX Assembler v{VERSION}")?;
        writeln!(self.out)
    }

    fn write_trace(&mut self, trace: &[String]) -> io::Result<()> {
        for entry in trace {
            writeln!(self.out, "{entry}")?;
        }
        Ok(())
    }

    fn footer(
        &mut self,
        counts: &PassCounts,
        symbols: &SymbolTable,
        total_bytes: usize,
    ) -> io::Result<()> {
        writeln!(
            self.out,
            "\nLines: {}  Errors: {}  Warnings: {}",
            counts.lines, counts.errors, counts.warnings
        )?;
        writeln!(self.out, "\nSYMBOL TABLE\n")?;
        symbols.dump(&mut self.out)?;
        writeln!(self.out, "\nTotal output is {} bytes", total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        classify, input_base_from_path, line_cost, resolve_output_path, run_with_cli, AsmErrorKind,
        Assembler, Cli, LineKind, ListingWriter, Severity,
    };
    use crate::encoder::AluOp;
    use clap::Parser;
    use std::fs;
    use std::path::PathBuf;
    use std::process;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn toks(line: &str) -> Vec<&str> {
        line.split_whitespace().collect()
    }

    fn kind_of(line: &str) -> LineKind {
        classify(&toks(line), true).expect(line)
    }

    fn cost_of(line: &str) -> u64 {
        line_cost(&kind_of(line))
    }

    fn first_error_kind(source: &str) -> AsmErrorKind {
        let mut assembler = Assembler::new();
        let err = assembler.compile(source).expect_err("compile should fail");
        err.diagnostics()[0].error().kind()
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn classifies_every_syntactic_form() {
        assert_eq!(kind_of("_"), LineKind::Halt);
        assert_eq!(kind_of("."), LineKind::Break);
        assert_eq!(kind_of(".."), LineKind::Continue);
        assert_eq!(kind_of("= [x31++]"), LineKind::Return { ptr: 31 });
        assert_eq!(
            kind_of("SUB [--x31]"),
            LineKind::Call {
                target: "SUB".to_string(),
                ptr: 31
            }
        );
        assert_eq!(kind_of("[x4] x3"), LineKind::Store { ptr: 4, src: 3 });
        assert_eq!(
            kind_of("[--x31] x10"),
            LineKind::StorePreDec { ptr: 31, src: 10 }
        );
        assert_eq!(kind_of("x11 [x30]"), LineKind::Load { rd: 11, ptr: 30 });
        assert_eq!(
            kind_of("x11 [x30++]"),
            LineKind::LoadPostInc { rd: 11, ptr: 30 }
        );
        assert_eq!(
            kind_of("x5 x1 + x2"),
            LineKind::Arith {
                rd: 5,
                lhs: "x1".to_string(),
                op: AluOp::Add,
                rhs: "x2".to_string()
            }
        );
        assert_eq!(
            kind_of("x5 7"),
            LineKind::Move {
                rd: 5,
                src: "7".to_string()
            }
        );
        assert_eq!(
            kind_of("done"),
            LineKind::Jump {
                target: "done".to_string()
            }
        );
        assert_eq!(
            kind_of("loop :"),
            LineKind::Label {
                name: "loop".to_string()
            }
        );
        assert_eq!(
            kind_of("loop:"),
            LineKind::Label {
                name: "loop".to_string()
            }
        );
        assert_eq!(kind_of(":"), LineKind::Entry { value: None });
        assert_eq!(
            kind_of(": 0x8000"),
            LineKind::Entry {
                value: Some("0x8000".to_string())
            }
        );
    }

    #[test]
    fn range_needs_four_tokens_and_a_non_operator() {
        assert_eq!(
            kind_of("& x4 x1 x2 8"),
            LineKind::RangeOpen {
                rd: 4,
                rsrc: 1,
                rend: 2,
                step: Some("8".to_string())
            }
        );
        assert_eq!(
            kind_of("& x4 x1 x2"),
            LineKind::RangeOpen {
                rd: 4,
                rsrc: 1,
                rend: 2,
                step: None
            }
        );
        assert!(matches!(
            kind_of("& x1 < x2"),
            LineKind::WhileOpen { rs1: 1, rs2: 2, .. }
        ));
        assert!(matches!(
            kind_of("? x1 == x2"),
            LineKind::IfOpen { rs1: 1, rs2: 2, .. }
        ));
    }

    #[test]
    fn constants_are_only_recognized_before_code() {
        assert_eq!(
            classify(&toks("RAM 0x8000"), false).unwrap(),
            LineKind::ConstDef {
                name: "RAM".to_string(),
                value: "0x8000".to_string()
            }
        );
        assert_eq!(
            classify(&toks("RAM 0x8000"), true)
                .expect_err("after code this is not a constant")
                .kind(),
            AsmErrorKind::Syntax
        );
    }

    #[test]
    fn byte_contributions_match_the_table() {
        assert_eq!(cost_of("_"), 4);
        assert_eq!(cost_of("= [x31++]"), 12);
        assert_eq!(cost_of("SUB [--x31]"), 20);
        assert_eq!(cost_of("."), 4);
        assert_eq!(cost_of(".."), 4);
        assert_eq!(cost_of("& x4 x1 x2 8"), 8);
        assert_eq!(cost_of("& x1 < x2"), 4);
        assert_eq!(cost_of("? x1 == x2"), 4);
        assert_eq!(cost_of("[--x31] x10"), 8);
        assert_eq!(cost_of("[x4] x3"), 4);
        assert_eq!(cost_of("x11 [x30++]"), 8);
        assert_eq!(cost_of("x11 [x30]"), 4);
        assert_eq!(cost_of("x5 x1 + x2"), 4);
        assert_eq!(cost_of("x5 7"), 4);
        assert_eq!(cost_of("done"), 4);
        assert_eq!(cost_of("loop :"), 0);
        assert_eq!(cost_of(":"), 0);
    }

    #[test]
    fn unknown_register_is_fatal() {
        assert_eq!(first_error_kind(": 0\nx32 7"), AsmErrorKind::Register);
        assert_eq!(first_error_kind(": 0\n[y1] x3"), AsmErrorKind::Register);
    }

    #[test]
    fn invalid_condition_is_fatal() {
        assert_eq!(first_error_kind(": 0\n? x1 <> x2"), AsmErrorKind::Condition);
        assert_eq!(first_error_kind(": 0\n& x1 <"), AsmErrorKind::Condition);
    }

    #[test]
    fn break_outside_loop_is_fatal() {
        assert_eq!(first_error_kind(": 0\n."), AsmErrorKind::Loop);
        assert_eq!(first_error_kind(": 0\n.."), AsmErrorKind::Loop);
        // An if block does not serve as a loop target.
        assert_eq!(first_error_kind(": 0\n? x1 == x2\n  ."), AsmErrorKind::Loop);
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        assert_eq!(
            first_error_kind("A 1\nA 2\n: 0\n_"),
            AsmErrorKind::Symbol
        );
        assert_eq!(
            first_error_kind(": 0\nfoo :\nfoo :\n_"),
            AsmErrorKind::Symbol
        );
        assert_eq!(
            first_error_kind("A 1\n: 0\nA :\n_"),
            AsmErrorKind::Symbol
        );
    }

    #[test]
    fn unresolved_jump_target_is_fatal() {
        assert_eq!(first_error_kind(": 0\nnowhere"), AsmErrorKind::Symbol);
    }

    #[test]
    fn failed_compile_produces_no_output() {
        let mut assembler = Assembler::new();
        assert!(assembler.compile(": 0\nx5 7\nnowhere").is_err());
        assert!(assembler.bytes().is_empty());
        assert!(assembler.trace().is_empty());
    }

    #[test]
    fn halt_only_program_encodes_self_jump() {
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(": 0\n_\n").unwrap();
        assert_eq!(bytes, vec![0x6f, 0x00, 0x00, 0x00]);
        assert_eq!(assembler.trace(), &["; : 0".to_string(), "; _".to_string(), "  jal x0, 0".to_string()]);
    }

    #[test]
    fn small_immediate_uses_addi_from_zero() {
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(": 0\nx5 7").unwrap();
        assert_eq!(words(&bytes), vec![0x00700293]);
    }

    #[test]
    fn large_immediate_uses_lui_high_bits() {
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(": 0\nx5 0x10000").unwrap();
        assert_eq!(words(&bytes), vec![0x000102b7]);
        let report_warnings = assembler
            .take_diagnostics()
            .iter()
            .filter(|d| d.severity() == Severity::Warning)
            .count();
        assert_eq!(report_warnings, 0, "0x10000 has no low bits to lose");
    }

    #[test]
    fn truncated_immediate_warns_but_still_fits_four_bytes() {
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(": 0\nx5 0x8100").unwrap();
        assert_eq!(bytes.len(), 4);
        let diags = assembler.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity(), Severity::Warning);
        assert_eq!(diags[0].error().kind(), AsmErrorKind::Value);
    }

    #[test]
    fn register_move_is_addi_zero() {
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(": 0\nx5 x7").unwrap();
        // addi x5, x7, 0
        assert_eq!(words(&bytes), vec![0x00038293]);
    }

    #[test]
    fn arithmetic_folds_when_both_operands_are_values() {
        let mut assembler = Assembler::new();
        let folded = assembler.compile(": 0\nx5 3 + 4").unwrap();
        let direct = assembler.compile(": 0\nx5 7").unwrap();
        assert_eq!(folded, direct);
    }

    #[test]
    fn constants_participate_in_sizing_and_emission() {
        let source = "BASE 0x100\nSTEP 2\n: BASE\nx5 STEP\n_";
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(source).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(assembler.symbols().label(":"), Some(0x100));
        assert_eq!(assembler.symbols().constant("STEP"), Some(2));
        // addi x5, x0, 2
        assert_eq!(words(&bytes)[0], 0x00200293);
    }

    #[test]
    fn entry_point_sets_origin_for_labels() {
        let source = "RAM 0x8000\n: RAM\nstart :\n_\nstart";
        let mut assembler = Assembler::new();
        let bytes = assembler.compile(source).unwrap();
        assert_eq!(assembler.symbols().label("start"), Some(0x8000));
        assert_eq!(assembler.symbols().label(":"), Some(0x8000));
        // jump back to start: jal at 0x8004, offset -4
        assert_eq!(words(&bytes)[1], 0xffdff06f);
    }

    #[test]
    fn label_addresses_are_word_aligned() {
        let source = ": 0\na :\nx5 7\nb :\n& x1 < x2\n  [x1] x5\nc :\n_";
        let mut assembler = Assembler::new();
        assembler.compile(source).unwrap();
        for entry in assembler.symbols().entries() {
            if entry.is_label {
                assert_eq!(entry.val % 4, 0, "label {} misaligned", entry.name);
            }
        }
    }

    #[test]
    fn serial_compiles_reset_state() {
        let mut assembler = Assembler::new();
        assert!(assembler.compile(": 0\nbogus bogus bogus").is_err());
        let bytes = assembler.compile(": 0\n_").unwrap();
        assert_eq!(bytes.len(), 4);
        let mut has_old = false;
        for entry in assembler.symbols().entries() {
            has_old |= entry.name == "bogus";
        }
        assert!(!has_old);
    }

    #[test]
    fn trace_marks_end_of_blocks() {
        let source = ": 0\n& x1 < x2\n  x3 1\n_";
        let mut assembler = Assembler::new();
        assembler.compile(source).unwrap();
        let trace = assembler.trace().join("\n");
        assert!(trace.contains("; --- End of Block _B_START_0 ---"));
        assert!(trace.contains("; & x1 < x2"));
    }

    #[test]
    fn cli_parses_outputs_and_inputs() {
        let cli = Cli::parse_from([
            "msa", "-i", "prog.mx", "-l", "-x", "-b", "--labels", "-o", "out",
        ]);
        assert_eq!(cli.infiles, vec![PathBuf::from("prog.mx")]);
        assert_eq!(cli.list_name, Some(String::new()));
        assert_eq!(cli.hex_name, Some(String::new()));
        assert_eq!(cli.bin_name, Some(String::new()));
        assert_eq!(cli.labels_name, Some(String::new()));
        assert_eq!(cli.outfile, Some("out".to_string()));
    }

    #[test]
    fn input_base_from_path_requires_mx_extension() {
        let err = input_base_from_path(&PathBuf::from("prog.asm")).unwrap_err();
        assert_eq!(err.to_string(), "Input file must end with .mx");
        let (name, base) = input_base_from_path(&PathBuf::from("dir/prog.mx")).unwrap();
        assert_eq!(name, "dir/prog.mx");
        assert_eq!(base, "prog");
    }

    #[test]
    fn resolve_output_path_rules() {
        assert_eq!(
            resolve_output_path("prog", Some(String::new()), "lst"),
            Some("prog.lst".to_string())
        );
        assert_eq!(
            resolve_output_path("prog", Some("out.hex".to_string()), "hex"),
            Some("out.hex".to_string())
        );
        assert_eq!(
            resolve_output_path("prog", Some("out".to_string()), "hex"),
            Some("out.hex".to_string())
        );
        assert_eq!(resolve_output_path("prog", None, "hex"), None);
    }

    #[test]
    fn listing_has_header_and_footer() {
        let mut assembler = Assembler::new();
        assembler.compile(": 0\n_").unwrap();
        let mut out = Vec::new();
        let mut listing = ListingWriter::new(&mut out);
        listing.header().unwrap();
        listing.write_trace(assembler.trace()).unwrap();
        listing
            .footer(assembler.counts(), assembler.symbols(), 4)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("msa MULTIX Assembler v"));
        assert!(text.contains("SYMBOL TABLE"));
        assert!(text.contains("Total output is 4 bytes"));
    }

    #[test]
    fn run_writes_requested_outputs() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("msa-test-{}-{nanos}", process::id()));
        fs::create_dir_all(&dir).unwrap();
        let src_path = dir.join("prog.mx");
        fs::write(&src_path, ": 0\n_\n").unwrap();
        let out_base = dir.join("prog").to_string_lossy().to_string();

        let cli = Cli::parse_from([
            "msa",
            "-i",
            src_path.to_str().unwrap(),
            "-l",
            "-x",
            "-b",
            "--labels",
            "-o",
            out_base.as_str(),
        ]);
        let reports = run_with_cli(&cli).expect("run should succeed");
        assert_eq!(reports.len(), 1);

        let hex = fs::read_to_string(dir.join("prog.hex")).unwrap();
        assert_eq!(hex, "6F 00 00 00\n");
        let bin = fs::read(dir.join("prog.bin")).unwrap();
        assert_eq!(bin, vec![0x6f, 0x00, 0x00, 0x00]);
        let listing = fs::read_to_string(dir.join("prog.lst")).unwrap();
        assert!(listing.contains("jal x0, 0"));
        let labels: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("prog.json")).unwrap()).unwrap();
        let names: Vec<&str> = labels["labels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&":"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn run_requires_an_output_selection() {
        let cli = Cli::parse_from(["msa", "-i", "prog.mx"]);
        let err = run_with_cli(&cli).unwrap_err();
        assert!(err.to_string().contains("No outputs selected"));
    }
}
