use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_till, take_until, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, hex_digit1, one_of, space0},
    combinator::{map, not, opt, peek, recognize, value},
    multi::many0,
    sequence::{pair, preceded, terminated, tuple},
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    // Literal text is kept verbatim (suffixes included) so generators can re-emit it.
    IntLiteral(String),
    FloatLiteral(String),
    StringLiteral(String),

    /// A preprocessor line: `#name rest`, only recognized at the start of a line.
    Directive { name: String, rest: String },

    Op(String),

    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,

    // Comments (to be skipped)
    Comment,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        matches!(self, Token::Op(o) if o == op)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Token::Identifier(n) if n == name)
    }

    /// True for tokens that read as a word, so two in a row need a space between them.
    pub fn is_wordlike(&self) -> bool {
        matches!(
            self,
            Token::Identifier(_) | Token::IntLiteral(_) | Token::FloatLiteral(_) | Token::StringLiteral(_)
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) | Token::IntLiteral(s) | Token::FloatLiteral(s) | Token::Op(s) => {
                f.write_str(s)
            }
            Token::StringLiteral(s) => write!(f, "\"{}\"", s),
            Token::Directive { name, rest } if rest.is_empty() => write!(f, "#{}", name),
            Token::Directive { name, rest } => write!(f, "#{} {}", name, rest),
            Token::LeftParen => f.write_str("("),
            Token::RightParen => f.write_str(")"),
            Token::LeftBracket => f.write_str("["),
            Token::RightBracket => f.write_str("]"),
            Token::LeftBrace => f.write_str("{"),
            Token::RightBrace => f.write_str("}"),
            Token::Comma => f.write_str(","),
            Token::Semicolon => f.write_str(";"),
            Token::Colon => f.write_str(":"),
            Token::Dot => f.write_str("."),
            Token::Comment => Ok(()),
        }
    }
}

/// A token and the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {message}")]
pub struct LexError {
    pub line: u32,
    pub message: String,
}

fn parse_line_comment(input: &str) -> IResult<&str, Token> {
    value(Token::Comment, preceded(tag("//"), take_till(|c| c == '\n')))(input)
}

fn parse_block_comment(input: &str) -> IResult<&str, Token> {
    value(Token::Comment, tuple((tag("/*"), take_until("*/"), tag("*/"))))(input)
}

fn parse_directive(input: &str) -> IResult<&str, Token> {
    map(
        tuple((
            char('#'),
            space0,
            recognize(pair(alt((alpha1, tag("_"))), many0(alt((alphanumeric1, tag("_")))))),
            take_till(|c| c == '\n'),
        )),
        |(_, _, name, rest): (char, &str, &str, &str)| {
            // Trailing line comments are not part of the directive.
            let rest = match rest.find("//") {
                Some(pos) => &rest[..pos],
                None => rest,
            };
            Token::Directive {
                name: name.to_string(),
                rest: rest.trim().to_string(),
            }
        },
    )(input)
}

fn parse_identifier(input: &str) -> IResult<&str, Token> {
    map(
        recognize(pair(alt((alpha1, tag("_"))), many0(alt((alphanumeric1, tag("_")))))),
        |s: &str| Token::Identifier(s.to_string()),
    )(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, Token> {
    use nom::bytes::complete::take_while;

    let (rest, _) = char('"')(input)?;
    let (rest, content) = take_while(|c| c != '"' && c != '\n')(rest)?;
    let (rest, _) = char('"')(rest)?;

    Ok((rest, Token::StringLiteral(content.to_string())))
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize(tuple((one_of("eE"), opt(one_of("+-")), digit1)))(input)
}

fn parse_float_literal(input: &str) -> IResult<&str, Token> {
    map(
        recognize(terminated(
            alt((
                // 1.0, 1., 1.5e3
                recognize(tuple((digit1, char('.'), digit0, opt(exponent)))),
                // .5
                recognize(tuple((char('.'), digit1, opt(exponent)))),
                // 1e-3
                recognize(pair(digit1, exponent)),
                // 1f: a bare integer with a float suffix
                recognize(terminated(digit1, peek(one_of("fFhH")))),
            )),
            opt(one_of("fFhH")),
        )),
        |s: &str| Token::FloatLiteral(s.to_string()),
    )(input)
}

fn parse_int_literal(input: &str) -> IResult<&str, Token> {
    map(
        recognize(pair(
            alt((recognize(pair(alt((tag("0x"), tag("0X"))), hex_digit1)), digit1)),
            opt(one_of("uUlL")),
        )),
        |s: &str| Token::IntLiteral(s.to_string()),
    )(input)
}

fn parse_operator(input: &str) -> IResult<&str, Token> {
    let op = |s: &'static str| map(tag(s), |s: &str| Token::Op(s.to_string()));
    alt((
        // Longest operators first
        alt((op("<<="), op(">>="))),
        alt((
            op("&&"),
            op("||"),
            op("=="),
            op("!="),
            op("<="),
            op(">="),
            op("+="),
            op("-="),
            op("*="),
            op("/="),
            op("%="),
            op("&="),
            op("|="),
            op("^="),
            op("++"),
            op("--"),
            op("<<"),
            op(">>"),
            op("->"),
            op("::"),
        )),
        map(one_of("+-*/%=<>!&|^~?"), |c| Token::Op(c.to_string())),
    ))(input)
}

fn parse_delimiter(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::LeftParen, char('(')),
        value(Token::RightParen, char(')')),
        value(Token::LeftBracket, char('[')),
        value(Token::RightBracket, char(']')),
        value(Token::LeftBrace, char('{')),
        value(Token::RightBrace, char('}')),
        value(Token::Comma, char(',')),
        value(Token::Semicolon, char(';')),
        value(Token::Colon, terminated(char(':'), not(char(':')))),
        value(Token::Dot, char('.')),
    ))(input)
}

fn parse_token(input: &str) -> IResult<&str, Token> {
    alt((
        parse_line_comment,
        parse_block_comment,
        parse_string_literal,
        parse_float_literal,
        parse_int_literal,
        parse_identifier,
        parse_operator,
        parse_delimiter,
    ))(input)
}

fn count_lines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

pub fn tokenize(input: &str) -> Result<Vec<Lexeme>, LexError> {
    let mut remaining = input;
    let mut tokens = Vec::new();
    let mut line = 1u32;
    let mut at_line_start = true;

    while !remaining.is_empty() {
        if let Ok((rest, ws)) =
            take_while1::<_, &str, nom::error::Error<&str>>(|c: char| c.is_whitespace())(remaining)
        {
            let newlines = count_lines(ws);
            line += newlines;
            at_line_start |= newlines > 0;
            remaining = rest;
            continue;
        }

        if remaining.starts_with('#') {
            if !at_line_start {
                return Err(LexError {
                    line,
                    message: "'#' is only allowed at the start of a line".into(),
                });
            }
            let (rest, token) = parse_directive(remaining).map_err(|_| LexError {
                line,
                message: "malformed preprocessor directive".into(),
            })?;
            if let Token::Directive { rest: text, .. } = &token {
                if text.ends_with('\\') {
                    return Err(LexError {
                        line,
                        message: "line continuation in a directive is not supported".into(),
                    });
                }
            }
            tokens.push(Lexeme { token, line });
            remaining = rest;
            at_line_start = false;
            continue;
        }

        if remaining.starts_with("/*") && !remaining.contains("*/") {
            return Err(LexError {
                line,
                message: "unterminated block comment".into(),
            });
        }

        match parse_token(remaining) {
            Ok((rest, token)) => {
                let consumed = &remaining[..remaining.len() - rest.len()];
                remaining = rest;
                if matches!(token, Token::Comment) {
                    let newlines = count_lines(consumed);
                    line += newlines;
                    at_line_start |= newlines > 0;
                    continue;
                }
                tokens.push(Lexeme { token, line });
                at_line_start = false;
            }
            Err(_) => {
                let snippet: String = remaining.chars().take(16).collect();
                return Err(LexError {
                    line,
                    message: format!("unexpected input near '{}'", snippet),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|l| l.token).collect()
    }

    fn ident(s: &str) -> Token {
        Token::Identifier(s.to_string())
    }

    #[test]
    fn test_tokenize_marker_line() {
        assert_eq!(
            kinds("DECL_TEXTURE(PerFrame, Tex2D(float4), uAlbedo[4]);"),
            vec![
                ident("DECL_TEXTURE"),
                Token::LeftParen,
                ident("PerFrame"),
                Token::Comma,
                ident("Tex2D"),
                Token::LeftParen,
                ident("float4"),
                Token::RightParen,
                Token::Comma,
                ident("uAlbedo"),
                Token::LeftBracket,
                Token::IntLiteral("4".into()),
                Token::RightBracket,
                Token::RightParen,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_tokenize_literals_verbatim() {
        assert_eq!(
            kinds("1.0f 2u 0xFFu .5 3. 1e-3 0.5h 7"),
            vec![
                Token::FloatLiteral("1.0f".into()),
                Token::IntLiteral("2u".into()),
                Token::IntLiteral("0xFFu".into()),
                Token::FloatLiteral(".5".into()),
                Token::FloatLiteral("3.".into()),
                Token::FloatLiteral("1e-3".into()),
                Token::FloatLiteral("0.5h".into()),
                Token::IntLiteral("7".into()),
            ]
        );
    }

    #[test]
    fn test_longest_operator_wins() {
        assert_eq!(
            kinds("a <<= b && c->d"),
            vec![
                ident("a"),
                Token::Op("<<=".into()),
                ident("b"),
                Token::Op("&&".into()),
                ident("c"),
                Token::Op("->".into()),
                ident("d"),
            ]
        );
    }

    #[test]
    fn test_member_access_is_not_a_float() {
        assert_eq!(kinds("v.xy"), vec![ident("v"), Token::Dot, ident("xy")]);
    }

    #[test]
    fn test_comments_and_line_numbers() {
        let lexemes = tokenize("a // one\n/* two\nthree */ b\n\nc").unwrap();
        let lines: Vec<u32> = lexemes.iter().map(|l| l.line).collect();
        assert_eq!(lines, vec![1, 3, 5]);
    }

    #[test]
    fn test_directives_at_line_start() {
        let lexemes = tokenize("#include \"common.h\" // shared\n  #ifdef FT_PRIM_ID\nx\n#endif").unwrap();
        assert_eq!(
            lexemes[0].token,
            Token::Directive {
                name: "include".into(),
                rest: "\"common.h\"".into()
            }
        );
        assert_eq!(
            lexemes[1].token,
            Token::Directive {
                name: "ifdef".into(),
                rest: "FT_PRIM_ID".into()
            }
        );
        assert_eq!(lexemes[1].line, 2);
        assert_eq!(lexemes[3].line, 4);
    }

    #[test]
    fn test_hash_mid_line_is_rejected() {
        let err = tokenize("float x; #if A").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_directive_continuation_is_rejected() {
        assert!(tokenize("#if A && \\\n B\n#endif").is_err());
    }

    #[test]
    fn test_unterminated_block_comment() {
        let err = tokenize("a\n/* never closed").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
