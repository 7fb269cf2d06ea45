//! Lexer
//!
//! Byte-level scanner producing one token per call. Two quirks exist
//! for template strings:
//!
//! - [`Lexer::rewind`] restores the scanner to where it was before the
//!   most recent scan. The parser uses it exactly once per template
//!   gap: the token after the closing `}` was lexed as ordinary code
//!   but actually belongs to the string, so the parser pushes it back.
//! - [`Lexer::continue_template_string`] latches the next scan to
//!   resume inside the backtick string instead of skipping whitespace.
//!
//! String tokens carry the raw text between the delimiters; escape
//! sequences are processed later by the parser. Scan failures are
//! reported in-band as error tokens, so a pushed-back token leaves no
//! trace.

use std::rc::Rc;

use brio_core::{CompiledFile, Pos};

use crate::token::{lookup_ident, Token, TokenKind};

#[derive(Debug, Clone, Copy)]
struct ScanState {
    position: usize,
    next_position: usize,
    ch: u8,
    line: i32,
    column: i32,
}

pub struct Lexer {
    file: Option<Rc<CompiledFile>>,
    source: Vec<u8>,
    position: usize,
    next_position: usize,
    ch: u8,
    line: i32,
    column: i32,
    saved: ScanState,
    continue_template: bool,
}

impl Lexer {
    pub fn new(source: &str, file: Option<Rc<CompiledFile>>) -> Lexer {
        if let Some(f) = &file {
            for line in source.split('\n') {
                f.add_line(line);
            }
        }
        let mut lexer = Lexer {
            file,
            source: source.as_bytes().to_vec(),
            position: 0,
            next_position: 0,
            ch: 0,
            line: 0,
            column: -1,
            saved: ScanState {
                position: 0,
                next_position: 0,
                ch: 0,
                line: 0,
                column: -1,
            },
            continue_template: false,
        };
        lexer.read_char();
        lexer
    }

    /// Restore the scanner to the state before the last `next_token`.
    pub fn rewind(&mut self) {
        self.position = self.saved.position;
        self.next_position = self.saved.next_position;
        self.ch = self.saved.ch;
        self.line = self.saved.line;
        self.column = self.saved.column;
    }

    /// The next scan resumes inside a backtick string.
    pub fn continue_template_string(&mut self) {
        self.continue_template = true;
    }

    pub fn next_token(&mut self) -> Token {
        self.saved = ScanState {
            position: self.position,
            next_position: self.next_position,
            ch: self.ch,
            line: self.line,
            column: self.column,
        };

        if self.continue_template {
            self.continue_template = false;
            return self.read_template_segment();
        }

        self.skip_whitespace_and_comments();

        let pos = self.pos_here();
        match self.ch {
            0 => Token::new(TokenKind::Eof, "", pos),
            b'=' => self.two_char(b'=', TokenKind::Eq, TokenKind::Assign, pos),
            b'!' => self.two_char(b'=', TokenKind::NotEq, TokenKind::Bang, pos),
            b'+' => self.op_with_assign_or_double(
                TokenKind::Plus,
                TokenKind::PlusAssign,
                Some(TokenKind::PlusPlus),
                pos,
            ),
            b'-' => self.op_with_assign_or_double(
                TokenKind::Minus,
                TokenKind::MinusAssign,
                Some(TokenKind::MinusMinus),
                pos,
            ),
            b'*' => self.op_with_assign_or_double(
                TokenKind::Asterisk,
                TokenKind::AsteriskAssign,
                None,
                pos,
            ),
            b'/' => {
                self.op_with_assign_or_double(TokenKind::Slash, TokenKind::SlashAssign, None, pos)
            }
            b'%' => self.op_with_assign_or_double(
                TokenKind::Percent,
                TokenKind::PercentAssign,
                None,
                pos,
            ),
            b'^' => {
                self.op_with_assign_or_double(TokenKind::BitXor, TokenKind::BitXorAssign, None, pos)
            }
            b'<' => self.read_angle(true, pos),
            b'>' => self.read_angle(false, pos),
            b'&' => self.op_with_assign_or_double(
                TokenKind::BitAnd,
                TokenKind::BitAndAssign,
                Some(TokenKind::And),
                pos,
            ),
            b'|' => self.op_with_assign_or_double(
                TokenKind::BitOr,
                TokenKind::BitOrAssign,
                Some(TokenKind::Or),
                pos,
            ),
            b'?' => self.single(TokenKind::Question, pos),
            b',' => self.single(TokenKind::Comma, pos),
            b';' => self.single(TokenKind::Semicolon, pos),
            b':' => self.single(TokenKind::Colon, pos),
            b'.' => self.single(TokenKind::Dot, pos),
            b'(' => self.single(TokenKind::Lparen, pos),
            b')' => self.single(TokenKind::Rparen, pos),
            b'{' => self.single(TokenKind::Lbrace, pos),
            b'}' => self.single(TokenKind::Rbrace, pos),
            b'[' => self.single(TokenKind::Lbracket, pos),
            b']' => self.single(TokenKind::Rbracket, pos),
            b'$' => {
                if self.peek_char() == b'{' {
                    self.read_char();
                    self.read_char();
                    Token::new(TokenKind::Lbrace, "${", pos)
                } else {
                    self.read_char();
                    Token::new(TokenKind::Illegal, "$", pos)
                }
            }
            b'"' | b'\'' | b'`' => self.read_string(self.ch, pos),
            c if is_letter(c) => self.read_identifier(pos),
            c if c.is_ascii_digit() => self.read_number(pos),
            c => {
                self.read_char();
                Token::new(TokenKind::Illegal, (c as char).to_string(), pos)
            }
        }
    }

    fn pos_here(&self) -> Pos {
        match &self.file {
            Some(f) => Pos::new(f, self.line, self.column),
            None => Pos {
                file: None,
                line: self.line,
                column: self.column,
            },
        }
    }

    fn read_char(&mut self) {
        self.position = self.next_position;
        self.next_position += 1;
        self.ch = self.source.get(self.position).copied().unwrap_or(0);
        if self.ch == b'\n' {
            self.line += 1;
            self.column = -1;
        } else {
            self.column += 1;
        }
    }

    fn peek_char(&self) -> u8 {
        self.source.get(self.next_position).copied().unwrap_or(0)
    }

    fn single(&mut self, kind: TokenKind, pos: Pos) -> Token {
        self.read_char();
        Token::new(kind, kind.name(), pos)
    }

    /// `X=` makes `with_eq`, a bare `X` makes `plain`.
    fn two_char(&mut self, second: u8, with_eq: TokenKind, plain: TokenKind, pos: Pos) -> Token {
        self.read_char();
        if self.ch == second {
            self.read_char();
            Token::new(with_eq, with_eq.name(), pos)
        } else {
            Token::new(plain, plain.name(), pos)
        }
    }

    /// `X=` compound assign, `XX` doubled form, else plain.
    fn op_with_assign_or_double(
        &mut self,
        plain: TokenKind,
        with_assign: TokenKind,
        doubled: Option<TokenKind>,
        pos: Pos,
    ) -> Token {
        let first = self.ch;
        self.read_char();
        if self.ch == b'=' {
            self.read_char();
            return Token::new(with_assign, with_assign.name(), pos);
        }
        if let Some(double_kind) = doubled {
            if self.ch == first {
                self.read_char();
                return Token::new(double_kind, double_kind.name(), pos);
            }
        }
        Token::new(plain, plain.name(), pos)
    }

    /// `<` family: `<`, `<=`, `<<`, `<<=` (mirrored for `>`).
    fn read_angle(&mut self, less: bool, pos: Pos) -> Token {
        let first = self.ch;
        self.read_char();
        if self.ch == b'=' {
            self.read_char();
            let kind = if less { TokenKind::Lte } else { TokenKind::Gte };
            return Token::new(kind, kind.name(), pos);
        }
        if self.ch == first {
            self.read_char();
            if self.ch == b'=' {
                self.read_char();
                let kind = if less {
                    TokenKind::LshiftAssign
                } else {
                    TokenKind::RshiftAssign
                };
                return Token::new(kind, kind.name(), pos);
            }
            let kind = if less {
                TokenKind::Lshift
            } else {
                TokenKind::Rshift
            };
            return Token::new(kind, kind.name(), pos);
        }
        let kind = if less { TokenKind::Lt } else { TokenKind::Gt };
        Token::new(kind, kind.name(), pos)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.ch.is_ascii_whitespace() {
                self.read_char();
            }
            if self.ch == b'/' && self.peek_char() == b'/' {
                while self.ch != b'\n' && self.ch != 0 {
                    self.read_char();
                }
            } else {
                break;
            }
        }
    }

    /// `[A-Za-z_][A-Za-z0-9_]*`, with `::` joining segments into a
    /// module-qualified name.
    fn read_identifier(&mut self, pos: Pos) -> Token {
        let start = self.position;
        loop {
            while is_letter(self.ch) || self.ch.is_ascii_digit() {
                self.read_char();
            }
            if self.ch == b':' && self.peek_char() == b':' {
                self.read_char();
                self.read_char();
            } else {
                break;
            }
        }
        let literal = self.slice(start, self.position);
        let kind = lookup_ident(&literal);
        Token::new(kind, literal, pos)
    }

    /// Greedy scan over digit-ish characters; the parser re-validates
    /// with a numeric conversion.
    fn read_number(&mut self, pos: Pos) -> Token {
        let start = self.position;
        while matches!(self.ch,
            b'0'..=b'9' | b'.' | b'x' | b'X'
            | b'a'..=b'f' | b'A'..=b'F')
        {
            self.read_char();
        }
        let literal = self.slice(start, self.position);
        Token::new(TokenKind::Number, literal, pos)
    }

    /// Strings delimited by `"`, `'`, or a backtick. A backslash
    /// latches over the following character (including the
    /// delimiter); the raw text is kept for the parser to process.
    /// Inside a backtick string, an unescaped `${` stops the scan at
    /// the `$` and yields a template-string token.
    fn read_string(&mut self, delim: u8, pos: Pos) -> Token {
        self.read_char(); // opening delimiter
        self.scan_string_body(delim, pos)
    }

    /// Resume scanning a backtick string right after a `}` gap.
    fn read_template_segment(&mut self) -> Token {
        let pos = self.pos_here();
        self.scan_string_body(b'`', pos)
    }

    fn scan_string_body(&mut self, delim: u8, pos: Pos) -> Token {
        let start = self.position;
        let template = delim == b'`';
        let mut escaped = false;
        loop {
            if self.ch == 0 {
                return Token::new(
                    TokenKind::UnterminatedString,
                    self.slice(start, self.position),
                    pos,
                );
            }
            if escaped {
                escaped = false;
                self.read_char();
                continue;
            }
            if self.ch == b'\\' {
                escaped = true;
                self.read_char();
                continue;
            }
            if template && self.ch == b'$' && self.peek_char() == b'{' {
                // Stop at the '$'; the next scan turns "${" into '{'.
                let literal = self.slice(start, self.position);
                return Token::new(TokenKind::TemplateString, literal, pos);
            }
            if self.ch == delim {
                let literal = self.slice(start, self.position);
                self.read_char(); // closing delimiter
                return Token::new(TokenKind::String, literal, pos);
            }
            self.read_char();
        }
    }

    fn slice(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.source[start..end]).into_owned()
    }
}

fn is_letter(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, None);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn test_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("= == != < <= << <<= > >= >> >>= + ++ += - -- -= && & &= || | |= ^ ^="),
            vec![
                Assign, Eq, NotEq, Lt, Lte, Lshift, LshiftAssign, Gt, Gte, Rshift, RshiftAssign,
                Plus, PlusPlus, PlusAssign, Minus, MinusMinus, MinusAssign, And, BitAnd,
                BitAndAssign, Or, BitOr, BitOrAssign, BitXor, BitXorAssign
            ]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        use TokenKind::*;
        assert_eq!(
            kinds("var const fn foo recover import forx"),
            vec![Var, Const, Function, Ident, Recover, Import, Ident]
        );
    }

    #[test]
    fn test_module_qualified_ident() {
        let mut lexer = Lexer::new("math::sqrt(x)", None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Ident);
        assert_eq!(tok.literal, "math::sqrt");
        assert_eq!(lexer.next_token().kind, TokenKind::Lparen);
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // comment\n2"),
            vec![TokenKind::Number, TokenKind::Number]
        );
    }

    #[test]
    fn test_positions() {
        let file = CompiledFile::new("t.brio");
        let mut lexer = Lexer::new("a\n  b", Some(file));
        let a = lexer.next_token();
        assert_eq!((a.pos.line, a.pos.column), (0, 0));
        let b = lexer.next_token();
        assert_eq!((b.pos.line, b.pos.column), (1, 2));
    }

    #[test]
    fn test_string_literals_raw() {
        let mut lexer = Lexer::new(r#""a\"b" 'c'"#, None);
        let s = lexer.next_token();
        assert_eq!(s.kind, TokenKind::String);
        assert_eq!(s.literal, r#"a\"b"#);
        let c = lexer.next_token();
        assert_eq!(c.kind, TokenKind::String);
        assert_eq!(c.literal, "c");
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("\"abc", None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::UnterminatedString);
    }

    #[test]
    fn test_template_string_split() {
        let mut lexer = Lexer::new("`hello ${name}!`", None);
        let head = lexer.next_token();
        assert_eq!(head.kind, TokenKind::TemplateString);
        assert_eq!(head.literal, "hello ");
        assert_eq!(lexer.next_token().kind, TokenKind::Lbrace);
        let ident = lexer.next_token();
        assert_eq!(ident.kind, TokenKind::Ident);
        assert_eq!(ident.literal, "name");
        assert_eq!(lexer.next_token().kind, TokenKind::Rbrace);
        // Parser would now rewind and continue the template; simulate it.
        let stray = lexer.next_token();
        assert_eq!(stray.kind, TokenKind::Bang);
        lexer.rewind();
        lexer.continue_template_string();
        let tail = lexer.next_token();
        assert_eq!(tail.kind, TokenKind::String);
        assert_eq!(tail.literal, "!");
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_escaped_template_marker() {
        let mut lexer = Lexer::new(r"`a \${b`", None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::String);
        assert_eq!(tok.literal, r"a \${b");
    }

    #[test]
    fn test_plain_backtick_string() {
        let mut lexer = Lexer::new("`plain`", None);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::String);
        assert_eq!(tok.literal, "plain");
    }

    #[test]
    fn test_number_scan_is_greedy() {
        let mut lexer = Lexer::new("0x1F 3.25 12abc", None);
        assert_eq!(lexer.next_token().literal, "0x1F");
        assert_eq!(lexer.next_token().literal, "3.25");
        // Greedy scan swallows trailing hex-ish letters; the parser
        // rejects it during conversion.
        assert_eq!(lexer.next_token().literal, "12abc");
    }
}
