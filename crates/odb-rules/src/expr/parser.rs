use super::{Expr, ExprError, Function};

/// Parse a complete expression. Trailing input is an error.
pub(super) fn parse(text: &str) -> Result<Expr, ExprError> {
    let mut p = Parser {
        text,
        chars: text.chars().collect(),
        pos: 0,
    };
    let expr = p.expression()?;
    p.skip_ws();
    if p.pos < p.chars.len() {
        return Err(p.error(format!("unexpected '{}'", p.chars[p.pos])));
    }
    Ok(expr)
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        let mut expr = self.primary()?;
        while self.peek() == Some('.') {
            self.pos += 1;
            let field = self.field()?;
            expr = Expr::Access(Box::new(expr), field);
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            None => Err(self.error("unexpected end of expression")),
            Some('.') => {
                self.pos += 1;
                Ok(Expr::Field(self.field()?))
            }
            Some(q @ ('\'' | '"')) => self.string(q),
            Some(c) if c == '-' || c.is_ascii_digit() => self.int(),
            Some(c) if is_ident_char(c) => self.word(),
            Some(c) => Err(self.error(format!("unexpected '{c}'"))),
        }
    }

    /// `this` or a function call `ns:name(args...)`.
    fn word(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        let ns = self.ident();
        if self.peek() != Some(':') {
            if ns == "this" {
                return Ok(Expr::This);
            }
            return Err(self.error_at(start, format!("unknown identifier '{ns}'")));
        }
        self.pos += 1;
        let name = self.ident();
        if name.is_empty() {
            return Err(self.error("function name expected"));
        }
        let func: Function = format!("{ns}:{name}")
            .parse()
            .map_err(|m: String| self.error_at(start, m))?;
        self.skip_ws();
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(Expr::Call(func, args));
        }
        loop {
            args.push(self.expression()?);
            self.skip_ws();
            match self.next() {
                Some(',') => continue,
                Some(')') => break,
                Some(c) => return Err(self.error_at(self.pos - 1, format!("expected ',' or ')', got '{c}'"))),
                None => return Err(self.error("unclosed argument list")),
            }
        }
        Ok(Expr::Call(func, args))
    }

    fn int(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse::<i64>()
            .map(Expr::Int)
            .map_err(|e| self.error_at(start, format!("bad integer '{literal}': {e}")))
    }

    /// Quoted literal. A backslash before the quote character escapes it;
    /// any other backslash is kept as is.
    fn string(&mut self, quote: char) -> Result<Expr, ExprError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.next() {
                None => return Err(self.error_at(start, "unterminated string")),
                Some(c) if c == quote => return Ok(Expr::Str(out)),
                Some('\\') => {
                    let escaped = self
                        .next()
                        .ok_or_else(|| self.error_at(start, "unterminated string"))?;
                    if escaped != quote {
                        out.push('\\');
                    }
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn field(&mut self) -> Result<String, ExprError> {
        let name = self.ident();
        if name.is_empty() {
            return Err(self.error("field name expected after '.'"));
        }
        Ok(name)
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn expect(&mut self, c: char) -> Result<(), ExprError> {
        match self.next() {
            Some(got) if got == c => Ok(()),
            Some(got) => Err(self.error_at(self.pos - 1, format!("expected '{c}', got '{got}'"))),
            None => Err(self.error(format!("expected '{c}'"))),
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, pos: usize, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            expr: self.text.to_string(),
            pos,
            message: message.into(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
