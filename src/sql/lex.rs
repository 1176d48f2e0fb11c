use crate::errof;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    Star,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Slash,
    Percent,
    Eof,
}

/// Tokenise one statement. Identifiers follow SQL rules, strings are
/// single-quoted, numbers are unsigned unless explicitly signed.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            ',' => {
                chars.next();
                out.push(Token::Comma);
            }
            ';' => {
                chars.next();
                out.push(Token::Semicolon);
            }
            '*' => {
                chars.next();
                out.push(Token::Star);
            }
            '+' => {
                chars.next();
                out.push(Token::Plus);
            }
            '/' => {
                chars.next();
                out.push(Token::Slash);
            }
            '%' => {
                chars.next();
                out.push(Token::Percent);
            }
            '=' => {
                chars.next();
                out.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Ne);
                } else {
                    return Err(errof!(Parser, "lex", "unexpected '!'"));
                }
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        out.push(Token::Le);
                    }
                    Some('>') => {
                        chars.next();
                        out.push(Token::Ne);
                    }
                    _ => out.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Ge);
                } else {
                    out.push(Token::Gt);
                }
            }
            '-' => {
                chars.next();
                // negative literal or minus operator, decided by lookahead
                if chars.peek().is_some_and(char::is_ascii_digit) {
                    let (int, float) = lex_number(&mut chars)?;
                    match (int, float) {
                        (Some(u), _) => out.push(Token::Int(-(u as i64))),
                        (_, Some(f)) => out.push(Token::Float(-f)),
                        _ => unreachable!("number lexed"),
                    }
                } else {
                    out.push(Token::Minus);
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // doubled quote escapes a quote
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(c) => s.push(c),
                        None => return Err(errof!(Parser, "lex", "unterminated string")),
                    }
                }
                out.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let (int, float) = lex_number(&mut chars)?;
                match (int, float) {
                    (Some(u), _) => out.push(Token::UInt(u)),
                    (_, Some(f)) => out.push(Token::Float(f)),
                    _ => unreachable!("number lexed"),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Ident(s));
            }
            other => return Err(errof!(Parser, "lex", "unexpected character '{other}'")),
        }
    }
    out.push(Token::Eof);
    Ok(out)
}

type NumResult = (Option<u64>, Option<f64>);

fn lex_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<NumResult> {
    let mut s = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            s.push(c);
            chars.next();
        } else if c == '.' && !is_float {
            is_float = true;
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if is_float {
        let f = s.parse::<f64>().map_err(|e| errof!(Parser, "lex", "bad number: {e}"))?;
        Ok((None, Some(f)))
    } else {
        let u = s.parse::<u64>().map_err(|e| errof!(Parser, "lex", "bad number: {e}"))?;
        Ok((Some(u), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_select() {
        let toks = tokenize("select count(*) from buys where origin = 42").unwrap();
        assert_eq!(toks[0], Token::Ident("select".into()));
        assert!(toks.contains(&Token::Star));
        assert!(toks.contains(&Token::UInt(42)));
        assert_eq!(*toks.last().unwrap(), Token::Eof);
    }

    #[test]
    fn lexes_strings_and_negatives() {
        let toks = tokenize("insert into t values ('it''s', -5, -2.5)").unwrap();
        assert!(toks.contains(&Token::Str("it's".into())));
        assert!(toks.contains(&Token::Int(-5)));
        assert!(toks.contains(&Token::Float(-2.5)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(tokenize("select @").is_err());
        assert!(tokenize("select 'open").is_err());
    }
}
