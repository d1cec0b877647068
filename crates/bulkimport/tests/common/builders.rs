//! Builders for CSV fixtures.

#![allow(dead_code)]

/// Builds delimited text line by line.
pub struct CsvBuilder {
    delimiter: char,
    lines: Vec<String>,
}

impl CsvBuilder {
    pub fn new() -> Self {
        Self {
            delimiter: ',',
            lines: Vec::new(),
        }
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Adds a header line.
    pub fn header(self, columns: &[&str]) -> Self {
        self.row(columns)
    }

    pub fn row(mut self, fields: &[&str]) -> Self {
        let sep = self.delimiter.to_string();
        self.lines.push(fields.join(&sep));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    /// Adds `count` rows of the form `<n>,name<n>,user<n>@example.com`.
    pub fn numbered(mut self, count: usize) -> Self {
        for n in 1..=count {
            let sep = self.delimiter;
            self.lines
                .push(format!("{n}{sep}name{n}{sep}user{n}@example.com"));
        }
        self
    }

    pub fn build(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

impl Default for CsvBuilder {
    fn default() -> Self {
        Self::new()
    }
}
