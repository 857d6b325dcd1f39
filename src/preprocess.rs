// Lexer/preprocessor turning raw MULTIX source into line records.

/// A source line that survived comment stripping.
///
/// `indent` is the leading-whitespace column measured on the pre-trim text;
/// `line_num` is the original 1-based line number in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    pub text: String,
    pub indent: usize,
    pub line_num: u32,
}

#[derive(Debug, Default)]
pub struct Preprocessor {
    lines: Vec<LineRecord>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn lines(&self) -> &[LineRecord] {
        &self.lines
    }

    /// Strip comments from `source` and record the surviving lines.
    ///
    /// Block comments `;- … -;` are removed first, then each line is
    /// truncated at its first `;`. Lines that end up all-whitespace are
    /// discarded.
    pub fn process(&mut self, source: &str) {
        self.lines.clear();
        let stripped = strip_block_comments(source);
        for (idx, raw) in stripped.lines().enumerate() {
            let code = match raw.find(';') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let text = code.trim();
            if text.is_empty() {
                continue;
            }
            let indent = code.len() - code.trim_start().len();
            self.lines.push(LineRecord {
                text: text.to_string(),
                indent,
                line_num: (idx + 1) as u32,
            });
        }
    }
}

/// Remove every `;- … -;` region. Regions may span newlines and do not
/// nest; the earliest closing delimiter wins. Each removed region is
/// replaced by the line breaks it contained so surviving lines keep their
/// original numbers. An unterminated opener runs to end of input.
fn strip_block_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find(";-") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        match body.find("-;") {
            Some(close) => {
                let region = &rest[open..open + 2 + close + 2];
                for _ in region.matches('\n') {
                    out.push('\n');
                }
                rest = &body[close + 2..];
            }
            None => {
                for _ in rest[open..].matches('\n') {
                    out.push('\n');
                }
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::Preprocessor;

    fn lines_of(source: &str) -> Vec<(String, usize, u32)> {
        let mut pp = Preprocessor::new();
        pp.process(source);
        pp.lines()
            .iter()
            .map(|line| (line.text.clone(), line.indent, line.line_num))
            .collect()
    }

    #[test]
    fn records_indent_and_trimmed_text() {
        let lines = lines_of(": 0\n  x5 7\n\t_\n");
        assert_eq!(
            lines,
            vec![
                (": 0".to_string(), 0, 1),
                ("x5 7".to_string(), 2, 2),
                ("_".to_string(), 1, 3),
            ]
        );
    }

    #[test]
    fn truncates_at_eol_comment() {
        let lines = lines_of("x5 7 ; load five\n; whole line\n   ; indented comment\n_");
        assert_eq!(
            lines,
            vec![("x5 7".to_string(), 0, 1), ("_".to_string(), 0, 4)]
        );
    }

    #[test]
    fn removes_block_comments_and_keeps_line_numbers() {
        let src = ": 0\n;- a block\n   spanning lines -;\nx5 7\n";
        let lines = lines_of(src);
        assert_eq!(
            lines,
            vec![(": 0".to_string(), 0, 1), ("x5 7".to_string(), 0, 4)]
        );
    }

    #[test]
    fn earliest_block_close_wins() {
        let lines = lines_of(";- one -; x5 7 ;- two -;\n_");
        assert_eq!(
            lines,
            vec![("x5 7".to_string(), 1, 1), ("_".to_string(), 0, 2)]
        );
    }

    #[test]
    fn unterminated_block_comment_runs_to_end() {
        let lines = lines_of("x5 7\n;- never closed\nx6 8\n");
        assert_eq!(lines, vec![("x5 7".to_string(), 0, 1)]);
    }

    #[test]
    fn comment_only_input_yields_nothing() {
        assert!(lines_of(";- all\ncomment -;\n; and this\n").is_empty());
    }
}
