//! Minimal CSV encoding for `COPY ... FROM STDIN WITH (FORMAT csv)`.
//!
//! An unquoted empty field is NULL; text is always quoted so an empty string
//! stays distinct from NULL.

/// Accumulates rows of one COPY payload.
#[derive(Debug, Default)]
pub struct CsvBuffer {
    buf: String,
    fields_in_row: usize,
    rows: usize,
}

impl CsvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn sep(&mut self) {
        if self.fields_in_row > 0 {
            self.buf.push(',');
        }
        self.fields_in_row += 1;
    }

    pub fn null(&mut self) -> &mut Self {
        self.sep();
        self
    }

    pub fn text(&mut self, value: &str) -> &mut Self {
        self.sep();
        self.buf.push('"');
        for c in value.chars() {
            if c == '"' {
                self.buf.push('"');
            }
            self.buf.push(c);
        }
        self.buf.push('"');
        self
    }

    pub fn opt_text(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.text(v),
            None => self.null(),
        }
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        self.sep();
        self.buf.push_str(&value.to_string());
        self
    }

    pub fn opt_int(&mut self, value: Option<i64>) -> &mut Self {
        match value {
            Some(v) => self.int(v),
            None => self.null(),
        }
    }

    /// Non-finite floats are written as NULL.
    pub fn float(&mut self, value: f64) -> &mut Self {
        if !value.is_finite() {
            return self.null();
        }
        self.sep();
        self.buf.push_str(&value.to_string());
        self
    }

    pub fn opt_float(&mut self, value: Option<f64>) -> &mut Self {
        match value {
            Some(v) => self.float(v),
            None => self.null(),
        }
    }

    pub fn boolean(&mut self, value: bool) -> &mut Self {
        self.sep();
        self.buf.push_str(if value { "t" } else { "f" });
        self
    }

    pub fn end_row(&mut self) {
        self.buf.push('\n');
        self.fields_in_row = 0;
        self.rows += 1;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_encoding() {
        let mut csv = CsvBuffer::new();
        csv.int(1).text("MRO/CTX/1").null().float(10.5).boolean(false);
        csv.end_row();
        csv.opt_int(None).text("").opt_float(Some(-2.0)).opt_text(None).boolean(true);
        csv.end_row();

        assert_eq!(csv.rows(), 2);
        assert_eq!(csv.as_str(), "1,\"MRO/CTX/1\",,10.5,f\n,\"\",-2,,t\n");
    }

    #[test]
    fn test_quotes_are_doubled() {
        let mut csv = CsvBuffer::new();
        csv.text("say \"hi\", then\nleave");
        csv.end_row();
        assert_eq!(csv.as_str(), "\"say \"\"hi\"\", then\nleave\"\n");
    }

    #[test]
    fn test_non_finite_float_is_null() {
        let mut csv = CsvBuffer::new();
        csv.float(f64::NAN).float(f64::INFINITY).int(3);
        csv.end_row();
        assert_eq!(csv.as_str(), ",,3\n");
    }
}
