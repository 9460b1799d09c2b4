use crate::ast::*;
use crate::error::{CompilerError, Result};
use crate::lexer::{self, Token};
use crate::variant::FeatureFlags;
use crate::bail_syntax_at;
use log::trace;

/// Words that look like calls when followed by `(` but are statements.
/// Largest resource array a declaration may name.
pub const MAX_ARRAY_LEN: u32 = 1 << 20;

const STATEMENT_KEYWORDS: &[&str] = &["if", "for", "while", "switch", "return", "do", "else", "case", "sizeof"];

/// Where an item is being parsed; restricts what may appear there.
#[derive(Debug, Clone, Copy, Default)]
struct ItemContext {
    in_block: bool,
    in_conditional: bool,
}

/// Prefix markers waiting for the entry point they annotate.
#[derive(Debug, Default)]
struct PendingMarkers {
    first: Option<(String, SourceLoc)>,
    root_signature: Option<String>,
    srt: Option<String>,
    num_threads: Option<[u32; 3]>,
}

pub struct Parser {
    tokens: Vec<Tok>,
    current: usize,
    file: String,
    pending: PendingMarkers,
}

impl Parser {
    pub fn new(tokens: Vec<Tok>, file: impl Into<String>) -> Self {
        Parser {
            tokens,
            current: 0,
            file: file.into(),
            pending: PendingMarkers::default(),
        }
    }

    pub fn parse(&mut self) -> Result<Program> {
        let (items, stop) = self.parse_items(ItemContext::default())?;
        if let Some(tok) = stop {
            bail_syntax_at!(tok.loc, "unexpected '{}'", tok.token);
        }
        self.check_no_pending()?;
        Ok(Program { items })
    }

    /// Parses items until end of input or a directive that closes the current scope.
    /// The closing directive is returned unconsumed.
    fn parse_items(&mut self, ctx: ItemContext) -> Result<(Vec<Item>, Option<Tok>)> {
        let mut items = Vec::new();
        loop {
            let Some(tok) = self.peek_tok().cloned() else {
                return Ok((items, None));
            };
            trace!("parse_items: next token = {:?}", tok.token);
            match &tok.token {
                Token::Directive { name, rest } => match name.as_str() {
                    "if" | "ifdef" | "ifndef" => {
                        self.advance();
                        let inner = ItemContext {
                            in_conditional: true,
                            ..ctx
                        };
                        let (cond, then, otherwise) = self.parse_conditional(
                            name,
                            rest,
                            &tok.loc,
                            &mut |p: &mut Self| p.parse_items(inner).map(|(items, _)| items),
                            &|cond, then, otherwise, loc| Item::Conditional {
                                cond,
                                then,
                                otherwise,
                                loc,
                            },
                        )?;
                        items.push(Item::Conditional {
                            cond,
                            then,
                            otherwise,
                            loc: tok.loc.clone(),
                        });
                    }
                    "else" | "elif" | "endif" | "end" => return Ok((items, Some(tok.clone()))),
                    "vert" | "frag" | "comp" => {
                        if ctx.in_block {
                            bail_syntax_at!(tok.loc, "shader blocks cannot be nested");
                        }
                        if ctx.in_conditional {
                            bail_syntax_at!(tok.loc, "shader blocks cannot appear inside conditional blocks");
                        }
                        self.advance();
                        items.push(Item::ShaderBlock(self.parse_shader_block(name, rest, &tok.loc)?));
                    }
                    other => bail_syntax_at!(tok.loc, "unknown directive '#{}'", other),
                },
                Token::Semicolon => {
                    self.advance();
                }
                Token::Identifier(word) => match word.as_str() {
                    "STRUCT" => {
                        self.check_no_pending()?;
                        items.push(Item::Struct(self.parse_struct()?));
                    }
                    "BEGIN_SRT" => {
                        self.check_no_pending()?;
                        if ctx.in_conditional {
                            bail_syntax_at!(tok.loc, "resource tables cannot appear inside conditional blocks");
                        }
                        items.push(Item::Srt(self.parse_srt()?));
                    }
                    "BEGIN_SHARED_SRT_SET" => {
                        self.check_no_pending()?;
                        if ctx.in_conditional {
                            bail_syntax_at!(tok.loc, "shared resource sets cannot appear inside conditional blocks");
                        }
                        items.push(Item::SharedSet(self.parse_shared_set()?));
                    }
                    "ROOT_SIGNATURE" | "USE_SRT" | "NUM_THREADS" => self.parse_prefix_marker()?,
                    _ => items.push(self.parse_function_or_global()?),
                },
                _ => {
                    self.check_no_pending()?;
                    items.push(self.parse_global()?);
                }
            }
        }
    }

    /// Shared `#if`/`#else`/`#elif`/`#endif` handling. `branch` parses one branch and must
    /// stop (without consuming) at the directive that ends it.
    fn parse_conditional<T>(
        &mut self,
        directive: &str,
        rest: &str,
        loc: &SourceLoc,
        branch: &mut dyn FnMut(&mut Self) -> Result<Vec<T>>,
        wrap: &dyn Fn(Condition, Vec<T>, Vec<T>, SourceLoc) -> T,
    ) -> Result<(Condition, Vec<T>, Vec<T>)> {
        trace!("parse_conditional: #{} {}", directive, rest);
        let cond = parse_condition(directive, rest, loc)?;
        let then = branch(self)?;
        let otherwise = match self.advance().cloned() {
            Some(Tok {
                token: Token::Directive { name, rest },
                loc: else_loc,
            }) => match name.as_str() {
                "endif" => Vec::new(),
                "else" => {
                    let otherwise = branch(self)?;
                    self.expect_directive("endif", loc)?;
                    otherwise
                }
                "elif" => {
                    let (c, t, o) = self.parse_conditional("if", &rest, &else_loc, branch, wrap)?;
                    vec![wrap(c, t, o, else_loc)]
                }
                other => bail_syntax_at!(else_loc, "'#{}' inside an unterminated '#{}' block", other, directive),
            },
            Some(tok) => bail_syntax_at!(tok.loc, "unterminated '#{}' block opened at line {}", directive, loc.line),
            None => bail_syntax_at!(loc, "unterminated '#{}' block", directive),
        };
        Ok((cond, then, otherwise))
    }

    fn parse_shader_block(&mut self, directive: &str, rest: &str, loc: &SourceLoc) -> Result<ShaderBlock> {
        let stage = Stage::from_block_directive(directive)
            .ok_or_else(|| CompilerError::syntax(loc, format!("unknown shader block '#{}'", directive)))?;
        let mut flags = FeatureFlags::empty();
        let mut name = None;
        for word in rest.split_whitespace() {
            if word.starts_with("FT_") {
                let flag = FeatureFlags::from_symbol(word)
                    .ok_or_else(|| CompilerError::syntax(loc, format!("unknown feature flag '{}'", word)))?;
                flags |= flag;
            } else if name.replace(word.to_string()).is_some() {
                bail_syntax_at!(loc, "shader block declares more than one output name");
            }
        }
        let Some(name) = name else {
            bail_syntax_at!(loc, "shader block '#{}' is missing an output name", directive);
        };
        trace!("parse_shader_block: {} {} [{:?}]", stage, name, flags);

        let (items, stop) = self.parse_items(ItemContext {
            in_block: true,
            in_conditional: false,
        })?;
        self.check_no_pending()?;
        match stop {
            Some(Tok {
                token: Token::Directive { name: end, .. },
                ..
            }) if end == "end" => {
                self.advance();
            }
            Some(tok) => bail_syntax_at!(tok.loc, "unexpected '{}' in shader block '{}'", tok.token, name),
            None => bail_syntax_at!(loc, "shader block '{}' is missing '#end'", name),
        }
        Ok(ShaderBlock {
            stage,
            flags,
            name,
            items,
            loc: loc.clone(),
        })
    }

    fn parse_struct(&mut self) -> Result<StructDecl> {
        let (loc, args) = self.marker("STRUCT")?;
        let name = arg_ident(&args, 0, &loc, "struct name")?;
        expect_arg_count(&args, 1, "STRUCT", &loc)?;
        trace!("parse_struct: {}", name);

        self.expect(Token::LeftBrace)?;
        let members = self.parse_struct_members()?;
        self.expect(Token::RightBrace)?;
        self.eat(&Token::Semicolon);
        Ok(StructDecl { name, members, loc })
    }

    fn parse_struct_members(&mut self) -> Result<Vec<StructMember>> {
        let mut members = Vec::new();
        loop {
            let Some(tok) = self.peek_tok().cloned() else {
                return Ok(members);
            };
            match &tok.token {
                Token::RightBrace => return Ok(members),
                Token::Directive { name, rest } => match name.as_str() {
                    "if" | "ifdef" | "ifndef" => {
                        self.advance();
                        let (cond, then, otherwise) = self.parse_conditional(
                            name,
                            rest,
                            &tok.loc,
                            &mut |p: &mut Self| p.parse_struct_members(),
                            &|cond, then, otherwise, _| StructMember::Conditional { cond, then, otherwise },
                        )?;
                        members.push(StructMember::Conditional { cond, then, otherwise });
                    }
                    "else" | "elif" | "endif" => return Ok(members),
                    other => bail_syntax_at!(tok.loc, "'#{}' is not allowed inside a struct", other),
                },
                Token::Identifier(word) if word == "DATA" => {
                    let (loc, args) = self.marker("DATA")?;
                    expect_arg_count(&args, 3, "DATA", &loc)?;
                    let ty = DataType::from_name(&arg_ident(&args, 0, &loc, "field type")?);
                    let (name, array_len) = arg_name_with_len(&args[1], &loc)?;
                    let semantic = arg_ident(&args, 2, &loc, "semantic")?;
                    let semantic = (semantic != "None").then(|| Semantic::new(&semantic));
                    self.eat(&Token::Semicolon);
                    members.push(StructMember::Field(Field {
                        ty,
                        name,
                        array_len,
                        semantic,
                        loc,
                    }));
                }
                other => bail_syntax_at!(tok.loc, "expected DATA(type, name, semantic) in struct, found '{}'", other),
            }
        }
    }

    fn parse_srt(&mut self) -> Result<SrtDecl> {
        let (loc, args) = self.marker("BEGIN_SRT")?;
        expect_arg_count(&args, 1, "BEGIN_SRT", &loc)?;
        let name = arg_ident(&args, 0, &loc, "table name")?;
        trace!("parse_srt: {}", name);

        let mut sets = Vec::new();
        loop {
            let Some(tok) = self.peek_tok().cloned() else {
                bail_syntax_at!(loc, "resource table '{}' is missing END_SRT", name);
            };
            match &tok.token {
                Token::Identifier(word) if word == "BEGIN_SRT_SET" => {
                    let (set_loc, args) = self.marker("BEGIN_SRT_SET")?;
                    expect_arg_count(&args, 1, "BEGIN_SRT_SET", &set_loc)?;
                    let frequency = arg_frequency(&args, 0, &set_loc)?;
                    let decls = self.parse_set_body(frequency, "END_SRT_SET")?;
                    sets.push(SetSource::Local(SetBlock {
                        frequency,
                        decls,
                        loc: set_loc,
                    }));
                }
                Token::Identifier(word) if word == "INCLUDE_SRT_SET" => {
                    let (inc_loc, args) = self.marker("INCLUDE_SRT_SET")?;
                    expect_arg_count(&args, 1, "INCLUDE_SRT_SET", &inc_loc)?;
                    let fragment = arg_ident(&args, 0, &inc_loc, "fragment name")?;
                    self.eat(&Token::Semicolon);
                    sets.push(SetSource::Shared { fragment, loc: inc_loc });
                }
                Token::Identifier(word) if word == "END_SRT" => {
                    let (end_loc, args) = self.marker("END_SRT")?;
                    let end_name = arg_ident(&args, 0, &end_loc, "table name")?;
                    if end_name != name {
                        bail_syntax_at!(end_loc, "END_SRT({}) closes BEGIN_SRT({})", end_name, name);
                    }
                    self.eat(&Token::Semicolon);
                    return Ok(SrtDecl { name, sets, loc });
                }
                Token::Directive { .. } => {
                    bail_syntax_at!(tok.loc, "conditional blocks are not allowed inside resource tables")
                }
                other => bail_syntax_at!(tok.loc, "unexpected '{}' in resource table '{}'", other, name),
            }
        }
    }

    fn parse_shared_set(&mut self) -> Result<SharedSet> {
        let (loc, args) = self.marker("BEGIN_SHARED_SRT_SET")?;
        expect_arg_count(&args, 2, "BEGIN_SHARED_SRT_SET", &loc)?;
        let name = arg_ident(&args, 0, &loc, "fragment name")?;
        let frequency = arg_frequency(&args, 1, &loc)?;
        trace!("parse_shared_set: {} ({})", name, frequency);

        let decls = self.parse_set_body_until(|p| p.check_ident("END_SHARED_SRT_SET"), &loc)?;
        let (end_loc, args) = self.marker("END_SHARED_SRT_SET")?;
        let end_name = arg_ident(&args, 0, &end_loc, "fragment name")?;
        if end_name != name {
            bail_syntax_at!(end_loc, "END_SHARED_SRT_SET({}) closes BEGIN_SHARED_SRT_SET({})", end_name, name);
        }
        self.eat(&Token::Semicolon);
        Ok(SharedSet {
            name,
            set: SetBlock { frequency, decls, loc },
        })
    }

    fn parse_set_body(&mut self, frequency: Frequency, end_marker: &'static str) -> Result<Vec<ResourceDecl>> {
        let start = self.loc();
        let decls = self.parse_set_body_until(|p| p.check_ident(end_marker), &start)?;
        let (end_loc, args) = self.marker(end_marker)?;
        let end_freq = arg_frequency(&args, 0, &end_loc)?;
        if end_freq != frequency {
            bail_syntax_at!(end_loc, "{}({}) closes a {} set", end_marker, end_freq, frequency);
        }
        self.eat(&Token::Semicolon);
        Ok(decls)
    }

    fn parse_set_body_until(&mut self, at_end: impl Fn(&Self) -> bool, start: &SourceLoc) -> Result<Vec<ResourceDecl>> {
        let mut decls = Vec::new();
        while !at_end(self) {
            let Some(tok) = self.peek_tok().cloned() else {
                bail_syntax_at!(start, "unterminated resource set");
            };
            match &tok.token {
                Token::Identifier(word) if word.starts_with("DECL_") => {
                    decls.push(self.parse_resource_decl()?);
                    self.eat(&Token::Semicolon);
                }
                Token::Directive { .. } => {
                    bail_syntax_at!(tok.loc, "conditional blocks are not allowed inside resource tables")
                }
                other => bail_syntax_at!(tok.loc, "expected a DECL_ marker, found '{}'", other),
            }
        }
        Ok(decls)
    }

    fn parse_resource_decl(&mut self) -> Result<ResourceDecl> {
        let marker = self.expect_identifier_peek()?;
        let (loc, args) = self.marker(&marker)?;
        expect_arg_count(&args, 3, &marker, &loc)?;
        let frequency = arg_frequency(&args, 0, &loc)?;
        let kind = parse_resource_kind(&marker, &args[1], &loc)?;
        let (name, array_len) = arg_name_with_len(&args[2], &loc)?;
        trace!("parse_resource_decl: {} {} ({})", marker, name, frequency);
        Ok(ResourceDecl {
            name,
            kind,
            array_len: array_len.unwrap_or(1),
            frequency,
            loc,
        })
    }

    fn parse_prefix_marker(&mut self) -> Result<()> {
        let marker = self.expect_identifier_peek()?;
        let (loc, args) = self.marker(&marker)?;
        self.eat(&Token::Semicolon);
        if self.pending.first.is_none() {
            self.pending.first = Some((marker.clone(), loc.clone()));
        }
        match marker.as_str() {
            "ROOT_SIGNATURE" => {
                expect_arg_count(&args, 1, &marker, &loc)?;
                self.pending.root_signature = Some(arg_ident(&args, 0, &loc, "root signature")?);
            }
            "USE_SRT" => {
                expect_arg_count(&args, 1, &marker, &loc)?;
                self.pending.srt = Some(arg_ident(&args, 0, &loc, "table name")?);
            }
            _ => {
                expect_arg_count(&args, 3, &marker, &loc)?;
                let mut dims = [1u32; 3];
                for (i, dim) in dims.iter_mut().enumerate() {
                    *dim = arg_u32(&args[i], &loc)?;
                    if *dim == 0 {
                        bail_syntax_at!(loc, "NUM_THREADS dimensions must be positive");
                    }
                }
                self.pending.num_threads = Some(dims);
            }
        }
        Ok(())
    }

    fn check_no_pending(&mut self) -> Result<()> {
        match self.pending.first.take() {
            Some((marker, loc)) => bail_syntax_at!(loc, "'{}' must directly precede an entry point", marker),
            None => Ok(()),
        }
    }

    fn parse_function_or_global(&mut self) -> Result<Item> {
        let mut offset = 0;
        while matches!(self.peek_at(offset), Some(Token::Identifier(q)) if q == "inline") {
            offset += 1;
        }
        let is_function = matches!(
            (self.peek_at(offset), self.peek_at(offset + 1), self.peek_at(offset + 2)),
            (
                Some(Token::Identifier(ty)),
                Some(Token::Identifier(_)),
                Some(Token::LeftParen)
            ) if !matches!(ty.as_str(), "static" | "const" | "groupshared" | "return")
        );
        if !is_function {
            self.check_no_pending()?;
            return self.parse_global();
        }
        for _ in 0..offset {
            self.advance();
        }

        let func = self.parse_function()?;
        match Stage::from_entry_name(&func.name) {
            Some(stage) => {
                let pending = std::mem::take(&mut self.pending);
                Ok(Item::EntryPoint(EntryPoint {
                    stage,
                    func,
                    root_signature: pending.root_signature,
                    srt: pending.srt,
                    num_threads: pending.num_threads,
                }))
            }
            None => {
                self.check_no_pending()?;
                Ok(Item::Function(func))
            }
        }
    }

    fn parse_function(&mut self) -> Result<Function> {
        let loc = self.loc();
        let return_type = DataType::from_name(&self.expect_identifier()?);
        let name = self.expect_identifier()?;
        trace!("parse_function: {} {}", return_type, name);

        self.expect(Token::LeftParen)?;
        let mut params = Vec::new();
        if !self.check(&Token::RightParen) {
            loop {
                params.push(self.parse_param()?);
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(Token::RightParen)?;

        self.expect(Token::LeftBrace)?;
        let (body, stop) = self.parse_fragments(&|t| matches!(t, Token::RightBrace))?;
        if stop != Stop::Terminator {
            bail_syntax_at!(loc, "unterminated body of '{}'", name);
        }
        self.expect(Token::RightBrace)?;
        Ok(Function {
            name,
            return_type,
            params,
            body,
            loc,
        })
    }

    fn parse_param(&mut self) -> Result<Param> {
        let loc = self.loc();
        if self.check_ident("const") {
            self.advance();
        }
        let word = self.expect_identifier_peek()?;
        let (ty, modifier, system_value, name) = if self.peek_at(1) == Some(&Token::LeftParen)
            && (word.starts_with("SV_") || matches!(word.as_str(), "in" | "out" | "inout"))
        {
            self.advance();
            self.expect(Token::LeftParen)?;
            let ty = DataType::from_name(&self.expect_identifier()?);
            self.expect(Token::RightParen)?;
            let name = self.expect_identifier()?;
            match word.as_str() {
                "in" => (ty, ParamModifier::In, None, name),
                "out" => (ty, ParamModifier::Out, None, name),
                "inout" => (ty, ParamModifier::InOut, None, name),
                sv => {
                    let Some(value) = SystemValue::parse(sv) else {
                        bail_syntax_at!(loc, "unknown system value '{}'", sv);
                    };
                    (ty, ParamModifier::In, Some(value), name)
                }
            }
        } else {
            let ty = DataType::from_name(&self.expect_identifier()?);
            let name = self.expect_identifier()?;
            (ty, ParamModifier::In, None, name)
        };

        let array_len = if self.check(&Token::LeftBracket) {
            self.advance();
            let len = match self.advance().map(|t| t.token.clone()) {
                Some(Token::IntLiteral(text)) => parse_u32_literal(&text),
                _ => None,
            };
            let Some(len) = len else {
                bail_syntax_at!(loc, "parameter '{}' needs a constant array length", name);
            };
            self.expect(Token::RightBracket)?;
            Some(len)
        } else {
            None
        };

        Ok(Param {
            ty,
            name,
            array_len,
            modifier,
            system_value,
            loc,
        })
    }

    fn parse_global(&mut self) -> Result<Item> {
        let loc = self.loc();
        trace!("parse_global at {}", loc);
        let (frags, stop) = self.parse_fragments(&|t| matches!(t, Token::Semicolon))?;
        if stop != Stop::Terminator {
            bail_syntax_at!(loc, "expected ';' after declaration");
        }
        self.expect(Token::Semicolon)?;
        Ok(Item::Global(Global { frags, loc }))
    }

    /// Parses body fragments up to (not including) a terminator at nesting depth zero,
    /// a branch directive, or end of input.
    fn parse_fragments(&mut self, stop: &dyn Fn(&Token) -> bool) -> Result<(Vec<Fragment>, Stop)> {
        let mut frags = Vec::new();
        let mut depth = 0usize;
        loop {
            let Some(tok) = self.peek_tok().cloned() else {
                return Ok((frags, Stop::EndOfInput));
            };
            match &tok.token {
                t if depth == 0 && stop(t) => return Ok((frags, Stop::Terminator)),
                Token::Directive { name, rest } => match name.as_str() {
                    "if" | "ifdef" | "ifndef" => {
                        self.advance();
                        let (cond, then, otherwise) = self.parse_conditional(
                            name,
                            rest,
                            &tok.loc,
                            &mut |p: &mut Self| p.parse_fragments(stop).map(|(frags, _)| frags),
                            &|cond, then, otherwise, loc| Fragment::Conditional {
                                cond,
                                then,
                                otherwise,
                                loc,
                            },
                        )?;
                        frags.push(Fragment::Conditional {
                            cond,
                            then,
                            otherwise,
                            loc: tok.loc.clone(),
                        });
                    }
                    "else" | "elif" | "endif" => return Ok((frags, Stop::Branch)),
                    other => bail_syntax_at!(tok.loc, "'#{}' is not allowed inside a function body", other),
                },
                Token::Identifier(word) if word == "INIT_MAIN" => {
                    self.advance();
                    self.expect(Token::Semicolon)?;
                    frags.push(Fragment::InitMain(tok.loc.clone()));
                }
                Token::Identifier(word) if word == "RETURN" && self.peek_at(1) == Some(&Token::LeftParen) => {
                    self.advance();
                    let args = self.parse_call_args(&tok.loc)?;
                    self.check_single_line("RETURN", &tok.loc)?;
                    self.eat(&Token::Semicolon);
                    frags.push(Fragment::Return {
                        args,
                        loc: tok.loc.clone(),
                    });
                }
                Token::Identifier(word)
                    if self.peek_at(1) == Some(&Token::LeftParen) && !STATEMENT_KEYWORDS.contains(&word.as_str()) =>
                {
                    self.advance();
                    let args = self.parse_call_args(&tok.loc)?;
                    frags.push(Fragment::Call {
                        name: word.clone(),
                        args,
                        loc: tok.loc.clone(),
                    });
                }
                Token::LeftParen | Token::LeftBracket | Token::LeftBrace => {
                    depth += 1;
                    self.advance();
                    frags.push(Fragment::Token(tok));
                }
                Token::RightParen | Token::RightBracket | Token::RightBrace => {
                    if depth == 0 {
                        bail_syntax_at!(tok.loc, "unbalanced '{}'", tok.token);
                    }
                    depth -= 1;
                    self.advance();
                    frags.push(Fragment::Token(tok));
                }
                _ => {
                    self.advance();
                    frags.push(Fragment::Token(tok));
                }
            }
        }
    }

    fn parse_call_args(&mut self, loc: &SourceLoc) -> Result<Vec<Vec<Fragment>>> {
        self.expect(Token::LeftParen)?;
        let mut args = Vec::new();
        loop {
            let (arg, stop) = self.parse_fragments(&|t| matches!(t, Token::Comma | Token::RightParen))?;
            if stop != Stop::Terminator {
                bail_syntax_at!(loc, "unterminated argument list");
            }
            let closing = self.check(&Token::RightParen);
            if !(closing && arg.is_empty() && args.is_empty()) {
                if arg.is_empty() {
                    bail_syntax_at!(loc, "empty argument");
                }
                args.push(arg);
            }
            self.advance();
            if closing {
                return Ok(args);
            }
        }
    }

    /// Reads `NAME(args...)` where every token must share the marker's line.
    fn marker(&mut self, marker: &str) -> Result<(SourceLoc, Vec<Vec<Tok>>)> {
        let loc = self.loc();
        if !self.check_ident(marker) {
            bail_syntax_at!(loc, "expected '{}'", marker);
        }
        self.advance();
        self.expect(Token::LeftParen)?;

        let mut args: Vec<Vec<Tok>> = vec![Vec::new()];
        let mut depth = 0usize;
        loop {
            let Some(tok) = self.advance().cloned() else {
                bail_syntax_at!(loc, "unterminated '{}'", marker);
            };
            if tok.loc != loc {
                bail_syntax_at!(loc, "marker '{}' must be written on a single line", marker);
            }
            match &tok.token {
                Token::RightParen if depth == 0 => break,
                Token::Comma if depth == 0 => {
                    args.push(Vec::new());
                    continue;
                }
                Token::LeftParen | Token::LeftBracket => depth += 1,
                Token::RightParen | Token::RightBracket => depth = depth.saturating_sub(1),
                _ => {}
            }
            if let Some(arg) = args.last_mut() {
                arg.push(tok);
            }
        }
        if args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        Ok((loc, args))
    }

    /// The token just consumed must sit on the marker's line.
    fn check_single_line(&self, marker: &str, loc: &SourceLoc) -> Result<()> {
        match self.current.checked_sub(1).and_then(|i| self.tokens.get(i)) {
            Some(last) if last.loc != *loc => {
                bail_syntax_at!(loc, "marker '{}' must be written on a single line", marker)
            }
            _ => Ok(()),
        }
    }

    fn expect_directive(&mut self, name: &str, opened: &SourceLoc) -> Result<()> {
        match self.advance() {
            Some(Tok {
                token: Token::Directive { name: found, .. },
                ..
            }) if found == name => Ok(()),
            Some(tok) => {
                let loc = tok.loc.clone();
                bail_syntax_at!(loc, "expected '#{}' for block opened at line {}", name, opened.line)
            }
            None => bail_syntax_at!(opened, "missing '#{}'", name),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.current).map(|t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.current + offset).map(|t| &t.token)
    }

    fn peek_tok(&self) -> Option<&Tok> {
        self.tokens.get(self.current)
    }

    /// Location of the next token, or of the last one at end of input.
    fn loc(&self) -> SourceLoc {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map(|t| t.loc.clone())
            .unwrap_or_else(|| SourceLoc::new(self.file.as_str(), 1))
    }

    fn advance(&mut self) -> Option<&Tok> {
        if !self.is_at_end() {
            self.current += 1;
            self.tokens.get(self.current - 1)
        } else {
            None
        }
    }

    fn check(&self, token: &Token) -> bool {
        if let Some(t) = self.peek() {
            std::mem::discriminant(t) == std::mem::discriminant(token)
        } else {
            false
        }
    }

    fn check_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Some(t) if t.is_ident(name))
    }

    fn eat(&mut self, token: &Token) -> bool {
        let found = self.check(token);
        if found {
            self.advance();
        }
        found
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.check(&token) {
            self.advance();
            Ok(())
        } else {
            let found = self.peek().map(|t| t.to_string()).unwrap_or_else(|| "end of input".into());
            bail_syntax_at!(self.loc(), "expected '{}', found '{}'", token, found)
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        let name = self.expect_identifier_peek()?;
        self.advance();
        Ok(name)
    }

    fn expect_identifier_peek(&self) -> Result<String> {
        match self.peek() {
            Some(Token::Identifier(name)) => Ok(name.clone()),
            Some(other) => bail_syntax_at!(self.loc(), "expected identifier, found '{}'", other),
            None => bail_syntax_at!(self.loc(), "expected identifier, found end of input"),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.tokens.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Terminator,
    Branch,
    EndOfInput,
}

fn expect_arg_count(args: &[Vec<Tok>], count: usize, marker: &str, loc: &SourceLoc) -> Result<()> {
    if args.len() != count {
        bail_syntax_at!(loc, "'{}' takes {} argument(s), found {}", marker, count, args.len());
    }
    Ok(())
}

fn arg_ident(args: &[Vec<Tok>], index: usize, loc: &SourceLoc, what: &str) -> Result<String> {
    match args.get(index).map(Vec::as_slice) {
        Some([Tok {
            token: Token::Identifier(name),
            ..
        }]) => Ok(name.clone()),
        _ => bail_syntax_at!(loc, "expected {} as argument {}", what, index + 1),
    }
}

fn arg_frequency(args: &[Vec<Tok>], index: usize, loc: &SourceLoc) -> Result<Frequency> {
    let name = arg_ident(args, index, loc, "frequency")?;
    Frequency::from_name(&name).ok_or_else(|| {
        CompilerError::syntax(
            loc,
            format!("unknown frequency '{}' (expected Persistent, PerFrame, PerBatch or PerDraw)", name),
        )
    })
}

fn arg_u32(arg: &[Tok], loc: &SourceLoc) -> Result<u32> {
    match arg {
        [Tok {
            token: Token::IntLiteral(text),
            ..
        }] => parse_u32_literal(text)
            .ok_or_else(|| CompilerError::syntax(loc, format!("invalid integer '{}'", text))),
        _ => bail_syntax_at!(loc, "expected an integer constant"),
    }
}

fn parse_u32_literal(text: &str) -> Option<u32> {
    let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

/// `name` or `name[N]`.
fn arg_name_with_len(arg: &[Tok], loc: &SourceLoc) -> Result<(String, Option<u32>)> {
    let tokens: Vec<&Token> = arg.iter().map(|t| &t.token).collect();
    match tokens.as_slice() {
        [Token::Identifier(name)] => Ok((name.clone(), None)),
        [Token::Identifier(name), Token::LeftBracket, Token::IntLiteral(len), Token::RightBracket] => {
            match parse_u32_literal(len) {
                Some(n) if n > 0 && n <= MAX_ARRAY_LEN => Ok((name.clone(), Some(n))),
                Some(n) if n > MAX_ARRAY_LEN => {
                    bail_syntax_at!(loc, "array length {} of '{}' exceeds the limit of {}", n, name, MAX_ARRAY_LEN)
                }
                _ => bail_syntax_at!(loc, "array length of '{}' must be a positive constant", name),
            }
        }
        [Token::Identifier(name), Token::LeftBracket, Token::RightBracket] => {
            bail_syntax_at!(loc, "unbounded array '{}' needs an explicit length", name)
        }
        _ => bail_syntax_at!(loc, "expected a name or name[N]"),
    }
}

fn parse_resource_kind(marker: &str, arg: &[Tok], loc: &SourceLoc) -> Result<ResourceKind> {
    let tokens: Vec<&Token> = arg.iter().map(|t| &t.token).collect();
    let (ctor, elem) = match tokens.as_slice() {
        [Token::Identifier(ctor)] => (ctor.as_str(), None),
        [Token::Identifier(ctor), Token::LeftParen, Token::Identifier(elem), Token::RightParen] => {
            (ctor.as_str(), Some(DataType::from_name(elem)))
        }
        _ => bail_syntax_at!(loc, "malformed resource type in '{}'", marker),
    };

    let kind = match (marker, elem) {
        ("DECL_SAMPLER", None) => match ctor {
            "SamplerState" => Some(ResourceKind::Sampler { comparison: false }),
            "SamplerComparisonState" => Some(ResourceKind::Sampler { comparison: true }),
            _ => None,
        },
        ("DECL_TEXTURE", Some(elem)) => match TextureDim::from_name(ctor) {
            Some((dim, false)) => Some(ResourceKind::Texture { dim, elem }),
            _ => None,
        },
        ("DECL_RWTEXTURE", Some(elem)) => match TextureDim::from_name(ctor) {
            Some((dim, true)) if dim != TextureDim::Tex2DMS => Some(ResourceKind::RwTexture { dim, elem }),
            _ => None,
        },
        ("DECL_BUFFER", Some(elem)) if ctor == "Buffer" => Some(ResourceKind::Buffer { elem }),
        ("DECL_RWBUFFER", Some(elem)) if ctor == "RWBuffer" => Some(ResourceKind::RwBuffer { elem }),
        ("DECL_CBUFFER", Some(elem)) if ctor == "CBUFFER" || ctor == "ConstantBuffer" => {
            Some(ResourceKind::ConstantBuffer { elem })
        }
        _ => None,
    };
    kind.ok_or_else(|| CompilerError::syntax(loc, format!("'{}' cannot declare a resource of type '{}'", marker, ctor)))
}

/// Parses the condition of `#if`, `#ifdef` or `#ifndef`.
pub fn parse_condition(directive: &str, rest: &str, loc: &SourceLoc) -> Result<Condition> {
    let tokens: Vec<Token> = lexer::tokenize(rest)
        .map_err(|e| CompilerError::syntax(loc, format!("bad condition: {}", e.message)))?
        .into_iter()
        .map(|l| l.token)
        .collect();

    match directive {
        "ifdef" | "ifndef" => {
            let [Token::Identifier(name)] = tokens.as_slice() else {
                bail_syntax_at!(loc, "'#{}' takes exactly one symbol", directive);
            };
            let symbol = Condition::Symbol(name.clone());
            Ok(if directive == "ifndef" {
                Condition::Not(Box::new(symbol))
            } else {
                symbol
            })
        }
        _ => {
            let mut cursor = CondCursor { tokens: &tokens, pos: 0, loc };
            let cond = cursor.or()?;
            if cursor.pos != tokens.len() {
                bail_syntax_at!(loc, "trailing tokens in condition '{}'", rest);
            }
            Ok(cond)
        }
    }
}

struct CondCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    loc: &'a SourceLoc,
}

impl CondCursor<'_> {
    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(t) if t.is_op(op))
    }

    fn or(&mut self) -> Result<Condition> {
        let mut lhs = self.and()?;
        while self.peek_op("||") {
            self.pos += 1;
            lhs = Condition::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition> {
        let mut lhs = self.unary()?;
        while self.peek_op("&&") {
            self.pos += 1;
            lhs = Condition::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Condition> {
        let loc = self.loc;
        match self.next().cloned() {
            Some(Token::Op(op)) if op == "!" => Ok(Condition::Not(Box::new(self.unary()?))),
            Some(Token::LeftParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RightParen) => Ok(inner),
                    _ => bail_syntax_at!(loc, "missing ')' in condition"),
                }
            }
            Some(Token::Identifier(word)) if word == "defined" => {
                let parens = matches!(self.tokens.get(self.pos), Some(Token::LeftParen));
                if parens {
                    self.pos += 1;
                }
                let Some(Token::Identifier(name)) = self.next().cloned() else {
                    bail_syntax_at!(loc, "defined() needs a symbol");
                };
                if parens && !matches!(self.next(), Some(Token::RightParen)) {
                    bail_syntax_at!(loc, "missing ')' after defined({}", name);
                }
                Ok(Condition::Symbol(name))
            }
            Some(Token::Identifier(name)) => Ok(Condition::Symbol(name)),
            Some(Token::IntLiteral(text)) => Ok(Condition::Literal(text != "0")),
            Some(other) => bail_syntax_at!(loc, "unexpected '{}' in condition", other),
            None => bail_syntax_at!(loc, "incomplete condition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLoader;

    fn parse_str(input: &str) -> Result<Program> {
        let loaded = SourceLoader::default().load_str("test.fsl", input, None)?;
        Parser::new(loaded.tokens, loaded.name).parse()
    }

    /// Expects parsing to succeed and runs a check on the items.
    fn expect_parse<F>(input: &str, check_fn: F)
    where
        F: FnOnce(&[Item]) -> std::result::Result<(), String>,
    {
        let program = match parse_str(input) {
            Ok(program) => program,
            Err(e) => panic!("Failed to parse input: {}", e),
        };
        if let Err(msg) = check_fn(&program.items) {
            println!("Parsed items: {:#?}", program.items);
            panic!("Check failed: {}", msg);
        }
    }

    fn expect_parse_error(input: &str, fragment: &str) -> CompilerError {
        match parse_str(input) {
            Ok(program) => {
                println!("Parsed items: {:#?}", program.items);
                panic!("Expected parse to fail, but it succeeded");
            }
            Err(error) => {
                assert!(matches!(error, CompilerError::Syntax { .. }), "not a syntax error: {}", error);
                assert!(error.to_string().contains(fragment), "unexpected error: {}", error);
                error
            }
        }
    }

    const TABLE: &str = "
BEGIN_SRT(SrtData)
    BEGIN_SRT_SET(Persistent)
        DECL_TEXTURE(Persistent, Tex2D(float4), uTexture0)
        DECL_SAMPLER(Persistent, SamplerState, uSampler0)
    END_SRT_SET(Persistent)
    BEGIN_SRT_SET(PerFrame)
        DECL_BUFFER(PerFrame, Buffer(InstanceData), instanceBuffer)
        DECL_TEXTURE(PerFrame, Tex2D(float4), uLayers[4])
    END_SRT_SET(PerFrame)
END_SRT(SrtData)
";

    #[test]
    fn test_parse_resource_table() {
        expect_parse(TABLE, |items| {
            let [Item::Srt(srt)] = items else {
                return Err("expected one table".into());
            };
            if srt.name != "SrtData" || srt.sets.len() != 2 {
                return Err(format!("bad table {}", srt.name));
            }
            let SetSource::Local(frame) = &srt.sets[1] else {
                return Err("expected local set".into());
            };
            if frame.frequency != Frequency::PerFrame {
                return Err("wrong frequency".into());
            }
            let layers = &frame.decls[1];
            if layers.array_len != 4 || layers.kind.texture_dim() != Some(TextureDim::Tex2D) {
                return Err(format!("bad array decl {:?}", layers));
            }
            Ok(())
        });
    }

    #[test]
    fn test_parse_struct_with_conditional_field() {
        expect_parse(
            "STRUCT(VSOutput)\n{\n    DATA(float4, position, SV_Position);\n#ifdef FT_PRIM_ID\n    DATA(uint, primId, TEXCOORD1);\n#endif\n    DATA(float2, uv, texcoord0);\n};",
            |items| {
                let [Item::Struct(decl)] = items else {
                    return Err("expected struct".into());
                };
                match decl.members.as_slice() {
                    [StructMember::Field(pos), StructMember::Conditional { then, .. }, StructMember::Field(uv)] => {
                        if pos.semantic.as_ref().and_then(Semantic::system_value) != Some(SystemValue::Position) {
                            return Err("position semantic".into());
                        }
                        if then.len() != 1 || uv.semantic.as_ref().map(Semantic::as_str) != Some("TEXCOORD0") {
                            return Err("members".into());
                        }
                        Ok(())
                    }
                    other => Err(format!("unexpected members {:?}", other)),
                }
            },
        );
    }

    #[test]
    fn test_parse_entry_point_with_markers() {
        expect_parse(
            "ROOT_SIGNATURE(ComputeRootSignature)\nNUM_THREADS(8, 8, 1)\nvoid CS_MAIN(SV_DispatchThreadID(uint3) id)\n{\n    INIT_MAIN;\n    RETURN();\n}",
            |items| {
                let [Item::EntryPoint(entry)] = items else {
                    return Err("expected entry point".into());
                };
                if entry.stage != Stage::Compute || entry.num_threads != Some([8, 8, 1]) {
                    return Err("stage or threads".into());
                }
                if entry.root_signature.as_deref() != Some("ComputeRootSignature") {
                    return Err("root signature".into());
                }
                if entry.func.params[0].system_value != Some(SystemValue::DispatchThreadId) {
                    return Err("system value".into());
                }
                match entry.func.body.as_slice() {
                    [Fragment::InitMain(_), Fragment::Return { args, .. }] if args.is_empty() => Ok(()),
                    other => Err(format!("body {:?}", other)),
                }
            },
        );
    }

    #[test]
    fn test_parse_helper_with_modifiers_and_calls() {
        expect_parse(
            "void shade(in(float3) n, out(float4) c, inout(uint) count)\n{\n    c = float4(saturate(dot(n, n)), 0, 0, 1);\n    count += 1;\n}",
            |items| {
                let [Item::Function(f)] = items else {
                    return Err("expected function".into());
                };
                let modifiers: Vec<_> = f.params.iter().map(|p| p.modifier).collect();
                if modifiers != [ParamModifier::In, ParamModifier::Out, ParamModifier::InOut] {
                    return Err(format!("modifiers {:?}", modifiers));
                }
                let Some(Fragment::Call { name, args, .. }) = f.body.get(2) else {
                    return Err("expected constructor call".into());
                };
                if name != "float4" || args.len() != 4 {
                    return Err(format!("call {} / {}", name, args.len()));
                }
                Ok(())
            },
        );
    }

    #[test]
    fn test_parse_shader_blocks() {
        expect_parse(
            "#frag FT_PRIM_ID FT_MULTIVIEW basic\nfloat4 PS_MAIN() { INIT_MAIN; RETURN(float4(1, 1, 1, 1)); }\n#end\n#frag basic\nfloat4 PS_MAIN() { INIT_MAIN; RETURN(float4(0, 0, 0, 1)); }\n#end",
            |items| {
                let [Item::ShaderBlock(a), Item::ShaderBlock(b)] = items else {
                    return Err("expected two blocks".into());
                };
                if a.flags != FeatureFlags::PRIM_ID | FeatureFlags::MULTIVIEW || !b.flags.is_empty() {
                    return Err("flags".into());
                }
                if a.name != "basic" || a.stage != Stage::Pixel || a.items.len() != 1 {
                    return Err("block".into());
                }
                Ok(())
            },
        );
    }

    #[test]
    fn test_parse_elif_chain_in_body() {
        expect_parse(
            "float f()\n{\n#if defined(VULKAN) && !FT_VRS\n    return 1.0;\n#elif METAL\n    return 2.0;\n#else\n    return 3.0;\n#endif\n}",
            |items| {
                let [Item::Function(f)] = items else {
                    return Err("expected function".into());
                };
                let [Fragment::Conditional { otherwise, .. }] = f.body.as_slice() else {
                    return Err("expected conditional".into());
                };
                match otherwise.as_slice() {
                    [Fragment::Conditional { cond, otherwise, .. }] => {
                        if *cond != Condition::Symbol("METAL".into()) || otherwise.len() != 3 {
                            return Err("elif".into());
                        }
                        Ok(())
                    }
                    other => Err(format!("otherwise {:?}", other)),
                }
            },
        );
    }

    #[test]
    fn test_multi_line_marker_is_rejected() {
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Persistent)\nDECL_TEXTURE(Persistent,\n Tex2D(float4), t)\nEND_SRT_SET(Persistent)\nEND_SRT(T)",
            "single line",
        );
    }

    #[test]
    fn test_conditional_inside_table_is_rejected() {
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Persistent)\n#ifdef FT_VRS\nDECL_TEXTURE(Persistent, Tex2D(float4), t)\n#endif\nEND_SRT_SET(Persistent)\nEND_SRT(T)",
            "not allowed inside resource tables",
        );
    }

    #[test]
    fn test_bad_markers() {
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Hourly)\nEND_SRT_SET(Hourly)\nEND_SRT(T)",
            "unknown frequency",
        );
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Persistent)\nDECL_TEXTURE(Persistent, RWTex2D(float4), t)\nEND_SRT_SET(Persistent)\nEND_SRT(T)",
            "cannot declare",
        );
        expect_parse_error("USE_SRT(T)\nfloat x;", "must directly precede");
        expect_parse_error("#vert FT_WHATEVER name\n#end", "unknown feature flag");
        expect_parse_error("#frag name\nfloat4 PS_MAIN() { RETURN(1); }", "missing '#end'");
    }

    #[test]
    fn test_array_length_is_bounded() {
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Persistent)\nDECL_TEXTURE(Persistent, Tex2D(float4), a[4294967295])\nEND_SRT_SET(Persistent)\nEND_SRT(T)",
            "exceeds the limit",
        );
        expect_parse_error(
            "BEGIN_SRT(T)\nBEGIN_SRT_SET(Persistent)\nDECL_TEXTURE(Persistent, Tex2D(float4), a[0])\nEND_SRT_SET(Persistent)\nEND_SRT(T)",
            "positive constant",
        );
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = expect_parse_error("STRUCT(A)\n{\n    DATA(float4, a, None);\n    float b;\n};", "expected DATA");
        assert!(matches!(err, CompilerError::Syntax { line: 4, .. }));
    }

    #[test]
    fn test_condition_parsing() {
        let loc = SourceLoc::new("c", 1);
        let cond = parse_condition("if", "(FT_VRS || FT_ICB) && !defined METAL", &loc).unwrap();
        assert!(cond.evaluate(&|s| s == "FT_ICB"));
        assert!(!cond.evaluate(&|s| s == "FT_ICB" || s == "METAL"));
        assert_eq!(parse_condition("if", "0", &loc).unwrap(), Condition::Literal(false));
        assert!(parse_condition("if", "A &&", &loc).is_err());
    }
}
