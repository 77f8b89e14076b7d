use std::{collections::BTreeMap, str::FromStr};

use hashbrown::{HashMap, HashSet};

use super::{
    BinaryOperator, BlockId, CompareOperator, Function, Immediate, Instruction, Module, Operand,
    Phi, Terminator, Type, ValueId,
    lexer::{Lexer, Span, Token, TokenKind},
};
use crate::intern::InternedSymbol;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (at {line}:{column})")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub(super) fn at(source: &str, position: usize, message: impl Into<String>) -> Self {
        let before = &source[..position.min(source.len())];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);

        Self {
            line,
            column: before[line_start..].chars().count() + 1,
            message: message.into(),
        }
    }
}

/// Reads every function in `source`
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let mut parser = Parser::new(source)?;
    let mut module = Module::default();

    while parser.peek().is_some() {
        module.functions.push(parser.parse_function()?);
    }

    Ok(module)
}

/// Reads a source which holds exactly one function
pub fn parse_function(source: &str) -> Result<Function, ParseError> {
    let mut module = parse_module(source)?;

    match module.functions.len() {
        1 => Ok(module.functions.remove(0)),
        n => Err(ParseError::at(
            source,
            0,
            format!("expected exactly one function but found {n}"),
        )),
    }
}

struct Parser<'source> {
    source: &'source str,
    tokens: Vec<Token>,
    position: usize,
}

/// Name tables for the function currently being read
struct FunctionScope<'source> {
    function: Function,
    values: HashMap<&'source str, ValueId>,
    first_use: HashMap<ValueId, Span>,
    defined: HashSet<ValueId>,
    labels: HashMap<&'source str, BlockId>,
}

impl<'source> Parser<'source> {
    fn new(source: &'source str) -> Result<Self, ParseError> {
        Ok(Self {
            source,
            tokens: Lexer::tokenize(source)?,
            position: 0,
        })
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn peek_nth(&self, n: usize) -> Option<Token> {
        self.tokens.get(self.position + n).copied()
    }

    fn text(&self, token: Token) -> &'source str {
        &self.source[token.span.start..token.span.end]
    }

    /// Text of a `%value` or `.label` token without its sigil
    fn name(&self, token: Token) -> &'source str {
        &self.source[token.span.start + 1..token.span.end]
    }

    fn error(&self, span: Span, message: impl Into<String>) -> ParseError {
        ParseError::at(self.source, span.start, message)
    }

    fn error_at_end(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(self.source, self.source.len(), message)
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, ParseError> {
        let Some(token) = self.peek() else {
            return Err(
                self.error_at_end(format!("expected {expecting} but reached end of input"))
            );
        };

        self.position += 1;
        Ok(token)
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.expect_next(&format!("{kind:?}"))?;

        if token.kind != kind {
            return Err(self.error(
                token.span,
                format!(
                    "expected {kind:?} but found {:?} (`{}`)",
                    token.kind,
                    self.text(token)
                ),
            ));
        }

        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<Token, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;

        if self.text(token) != keyword {
            return Err(self.error(
                token.span,
                format!("expected `{keyword}` but found `{}`", self.text(token)),
            ));
        }

        Ok(token)
    }

    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|token| token.kind == kind)
    }

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;

        Type::from_str(self.text(token))
            .map_err(|_| self.error(token.span, format!("unknown type `{}`", self.text(token))))
    }

    fn parse_function(&mut self) -> Result<Function, ParseError> {
        self.expect_keyword("fn")?;
        let name = self.expect_next_to_be(TokenKind::Identifier)?;

        let mut scope = FunctionScope {
            function: Function::new(InternedSymbol::new(self.text(name))),
            values: HashMap::new(),
            first_use: HashMap::new(),
            defined: HashSet::new(),
            labels: HashMap::new(),
        };

        /* Parameters */

        self.expect_next_to_be(TokenKind::OpenParen)?;
        while !self.next_is(TokenKind::CloseParen) {
            let token = self.expect_next_to_be(TokenKind::Value)?;
            self.expect_next_to_be(TokenKind::Colon)?;
            let ty = self.parse_type()?;

            let parameter_name = self.name(token);
            if scope.values.contains_key(parameter_name) {
                return Err(self.error(token.span, format!("duplicate parameter %{parameter_name}")));
            }

            let id = scope.function.create_parameter(ty);
            scope.values.insert(parameter_name, id);
            scope.defined.insert(id);

            if !self.next_is(TokenKind::CloseParen) {
                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }
        self.expect_next_to_be(TokenKind::CloseParen)?;
        let open_brace = self.expect_next_to_be(TokenKind::OpenBrace)?;

        self.declare_labels(&mut scope)?;
        if scope.labels.is_empty() {
            return Err(self.error(open_brace.span, "function body has no blocks"));
        }

        /* Blocks */

        while !self.next_is(TokenKind::CloseBrace) {
            self.parse_block(&mut scope)?;
        }
        self.expect_next_to_be(TokenKind::CloseBrace)?;

        let undefined = scope
            .first_use
            .iter()
            .filter(|(value, _)| !scope.defined.contains(*value))
            .min_by_key(|(_, span)| span.start);

        if let Some((_, span)) = undefined {
            return Err(self.error(
                *span,
                format!("use of undefined value `{}`", &self.source[span.start..span.end]),
            ));
        }

        let mut function = scope.function;
        function.exit = function
            .blocks
            .values()
            .find(|block| block.returns())
            .map(|block| block.id);

        Ok(function)
    }

    /// Allocates block IDs in definition order before any block is read, so
    /// forward references resolve and layout order matches the source. A
    /// label followed by `:` defines a block unless it sits inside a phi's
    /// source list.
    fn declare_labels(&self, scope: &mut FunctionScope<'source>) -> Result<(), ParseError> {
        let mut previous: Option<TokenKind> = None;

        for (i, token) in self.tokens[self.position..].iter().enumerate() {
            if token.kind == TokenKind::CloseBrace {
                break;
            }

            let is_definition = token.kind == TokenKind::Label
                && self
                    .peek_nth(i + 1)
                    .is_some_and(|next| next.kind == TokenKind::Colon)
                && !matches!(
                    previous,
                    Some(TokenKind::OpenBracket) | Some(TokenKind::Comma)
                );

            if is_definition {
                let label = self.name(*token);
                if scope.labels.contains_key(label) {
                    return Err(self.error(token.span, format!("duplicate label .{label}")));
                }

                let id = scope.function.create_block();
                scope.labels.insert(label, id);
            }

            previous = Some(token.kind);
        }

        Ok(())
    }

    fn label(&mut self, scope: &FunctionScope<'source>) -> Result<BlockId, ParseError> {
        let token = self.expect_next_to_be(TokenKind::Label)?;

        scope
            .labels
            .get(self.name(token))
            .copied()
            .ok_or_else(|| self.error(token.span, format!("unknown label .{}", self.name(token))))
    }

    fn value(&self, scope: &mut FunctionScope<'source>, token: Token) -> ValueId {
        let name = self.name(token);

        if let Some(id) = scope.values.get(name) {
            return *id;
        }

        // the real type is filled in when the definition is reached
        let id = scope.function.create_value(Type::Int);
        scope.values.insert(name, id);
        scope.first_use.insert(id, token.span);
        id
    }

    fn define(
        &self,
        scope: &mut FunctionScope<'source>,
        token: Token,
        ty: Type,
    ) -> Result<ValueId, ParseError> {
        let id = self.value(scope, token);

        if !scope.defined.insert(id) {
            return Err(self.error(
                token.span,
                format!("value %{} is defined more than once", self.name(token)),
            ));
        }

        scope.function.values[id].ty = ty;
        Ok(id)
    }

    fn parse_operand(&mut self, scope: &mut FunctionScope<'source>) -> Result<Operand, ParseError> {
        let token = self.expect_next("an operand")?;

        match token.kind {
            TokenKind::Value => Ok(Operand::Value(self.value(scope, token))),
            TokenKind::Integer => self
                .text(token)
                .parse::<i64>()
                .map(|value| Operand::Immediate(Immediate::Int(value)))
                .map_err(|_| self.error(token.span, "integer literal out of range")),
            TokenKind::Identifier => match self.text(token) {
                "true" => Ok(Operand::Immediate(Immediate::Bool(true))),
                "false" => Ok(Operand::Immediate(Immediate::Bool(false))),
                "null" => Ok(Operand::Immediate(Immediate::Null)),
                other => Err(self.error(token.span, format!("expected an operand but found `{other}`"))),
            },
            kind => Err(self.error(token.span, format!("expected an operand but found {kind:?}"))),
        }
    }

    fn parse_arguments(
        &mut self,
        scope: &mut FunctionScope<'source>,
    ) -> Result<(InternedSymbol, Vec<Operand>), ParseError> {
        let target = self.expect_next_to_be(TokenKind::Identifier)?;
        let target = InternedSymbol::new(self.text(target));

        self.expect_next_to_be(TokenKind::OpenParen)?;
        let mut arguments = Vec::new();
        while !self.next_is(TokenKind::CloseParen) {
            arguments.push(self.parse_operand(scope)?);

            if !self.next_is(TokenKind::CloseParen) {
                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }
        self.expect_next_to_be(TokenKind::CloseParen)?;

        Ok((target, arguments))
    }

    fn parse_block(&mut self, scope: &mut FunctionScope<'source>) -> Result<(), ParseError> {
        let label = self.label(scope)?;
        self.expect_next_to_be(TokenKind::Colon)?;

        loop {
            let Some(token) = self.peek() else {
                return Err(self.error_at_end("block is missing a terminator"));
            };

            if token.kind == TokenKind::Identifier {
                match self.text(token) {
                    "jmp" | "br" | "ret" => {
                        let terminator = self.parse_terminator(scope)?;
                        scope.function.block_mut(label).terminator = terminator;
                        return Ok(());
                    }
                    "store" => {
                        self.position += 1;
                        let destination = self.parse_operand(scope)?;
                        self.expect_next_to_be(TokenKind::LeftArrow)?;
                        let source = self.parse_operand(scope)?;

                        scope
                            .function
                            .block_mut(label)
                            .instructions
                            .push(Instruction::Store {
                                destination,
                                source,
                            });
                        continue;
                    }
                    "call" => {
                        self.position += 1;
                        let (target, arguments) = self.parse_arguments(scope)?;

                        scope
                            .function
                            .block_mut(label)
                            .instructions
                            .push(Instruction::Call {
                                destination: None,
                                target,
                                arguments,
                            });
                        continue;
                    }
                    _ => {}
                }
            }

            if token.kind != TokenKind::Value {
                return Err(self.error(
                    token.span,
                    format!("expected an instruction but found `{}`", self.text(token)),
                ));
            }

            self.parse_definition(scope, label)?;
        }
    }

    fn parse_definition(
        &mut self,
        scope: &mut FunctionScope<'source>,
        label: BlockId,
    ) -> Result<(), ParseError> {
        let target = self.expect_next_to_be(TokenKind::Value)?;
        self.expect_next_to_be(TokenKind::Colon)?;
        let ty = self.parse_type()?;
        self.expect_next_to_be(TokenKind::Equals)?;
        let destination = self.define(scope, target, ty)?;

        let opcode = self
            .peek()
            .filter(|token| token.kind == TokenKind::Identifier)
            .map(|token| self.text(token));

        let instruction = match opcode {
            Some("phi") => {
                let token = self.expect_next_to_be(TokenKind::Identifier)?;

                if !scope.function.block(label).instructions.is_empty() {
                    return Err(self.error(
                        token.span,
                        "phi instructions must come before every other instruction in a block",
                    ));
                }

                let sources = self.parse_phi_sources(scope)?;
                scope.function.block_mut(label).phis.push(Phi {
                    destination,
                    sources,
                });
                return Ok(());
            }
            Some("alloca") => {
                self.position += 1;
                Instruction::Alloca {
                    destination,
                    ty: self.parse_type()?,
                }
            }
            Some("load") => {
                self.position += 1;
                Instruction::Load {
                    destination,
                    source: self.parse_operand(scope)?,
                }
            }
            Some("call") => {
                self.position += 1;
                let (target, arguments) = self.parse_arguments(scope)?;
                Instruction::Call {
                    destination: Some(destination),
                    target,
                    arguments,
                }
            }
            Some("cast") => {
                self.position += 1;
                let operand = self.parse_operand(scope)?;
                self.expect_keyword("as")?;
                Instruction::Cast {
                    destination,
                    operand,
                    ty: self.parse_type()?,
                }
            }
            Some("offset") => {
                self.position += 1;
                let base = self.parse_operand(scope)?;
                self.expect_next_to_be(TokenKind::Comma)?;
                Instruction::Offset {
                    destination,
                    base,
                    offset: self.parse_operand(scope)?,
                }
            }
            Some(opcode) => match (
                BinaryOperator::from_str(opcode),
                CompareOperator::from_str(opcode),
            ) {
                (Ok(operator), _) => {
                    self.position += 1;
                    let (lhs, rhs) = self.parse_operand_pair(scope)?;
                    Instruction::Binary {
                        operator,
                        destination,
                        lhs,
                        rhs,
                    }
                }
                (_, Ok(operator)) => {
                    self.position += 1;
                    let (lhs, rhs) = self.parse_operand_pair(scope)?;
                    Instruction::Compare {
                        operator,
                        destination,
                        lhs,
                        rhs,
                    }
                }
                _ => Instruction::Move {
                    destination,
                    source: self.parse_operand(scope)?,
                },
            },
            None => Instruction::Move {
                destination,
                source: self.parse_operand(scope)?,
            },
        };

        scope
            .function
            .block_mut(label)
            .instructions
            .push(instruction);

        Ok(())
    }

    fn parse_operand_pair(
        &mut self,
        scope: &mut FunctionScope<'source>,
    ) -> Result<(Operand, Operand), ParseError> {
        let lhs = self.parse_operand(scope)?;
        self.expect_next_to_be(TokenKind::Comma)?;
        let rhs = self.parse_operand(scope)?;
        Ok((lhs, rhs))
    }

    fn parse_phi_sources(
        &mut self,
        scope: &mut FunctionScope<'source>,
    ) -> Result<BTreeMap<BlockId, Operand>, ParseError> {
        let mut sources = BTreeMap::new();

        self.expect_next_to_be(TokenKind::OpenBracket)?;
        while !self.next_is(TokenKind::CloseBracket) {
            let token = self.peek();
            let predecessor = self.label(scope)?;
            self.expect_next_to_be(TokenKind::Colon)?;
            let operand = self.parse_operand(scope)?;

            if sources.insert(predecessor, operand).is_some() {
                let span = token.map_or(Span::new(0, 0), |token| token.span);
                return Err(self.error(span, "phi lists the same predecessor twice"));
            }

            if !self.next_is(TokenKind::CloseBracket) {
                self.expect_next_to_be(TokenKind::Comma)?;
            }
        }
        self.expect_next_to_be(TokenKind::CloseBracket)?;

        Ok(sources)
    }

    fn parse_terminator(
        &mut self,
        scope: &mut FunctionScope<'source>,
    ) -> Result<Terminator, ParseError> {
        let keyword = self.expect_next_to_be(TokenKind::Identifier)?;

        match self.text(keyword) {
            "jmp" => Ok(Terminator::Jump {
                destination: self.label(scope)?,
            }),
            "br" => {
                let condition = self.parse_operand(scope)?;
                let positive = self.label(scope)?;
                let negative = self.label(scope)?;
                Ok(Terminator::Branch {
                    condition,
                    positive,
                    negative,
                })
            }
            _ => {
                let has_value = self.peek().is_some_and(|token| match token.kind {
                    TokenKind::Identifier => {
                        matches!(self.text(token), "true" | "false" | "null")
                    }
                    kind => kind.can_start_operand(),
                });

                let value = if has_value {
                    Some(self.parse_operand(scope)?)
                } else {
                    None
                };

                Ok(Terminator::Return { value })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::index::Index;

    #[test]
    fn reads_a_loop() {
        let function = parse_function(indoc! {"
            fn count(%n: i64) {
            .entry:
                %i: ptr = alloca i64
                store %i <- 0
                jmp .header
            .header:
                %v: i64 = load %i
                %c: bool = lt %v, %n
                br %c .body .exit
            .body:
                %w: i64 = add %v, 1
                store %i <- %w
                call print(%w)
                jmp .header
            .exit:
                ret %v
            }
        "})
        .unwrap();

        assert_eq!(function.symbol_name.value(), "count");
        assert_eq!(function.parameters.len(), 1);
        assert_eq!(function.blocks.len(), 4);
        assert_eq!(function.entry, BlockId::new(0));
        assert_eq!(function.exit, Some(BlockId::new(3)));
        assert_eq!(
            function.block(BlockId::new(1)).terminator,
            Terminator::Branch {
                condition: Operand::Value(ValueId::new(3)),
                positive: BlockId::new(2),
                negative: BlockId::new(3),
            }
        );
        assert_eq!(function.values[ValueId::new(3)].ty, Type::Bool);
        assert_eq!(function.block(BlockId::new(2)).instructions.len(), 3);
    }

    #[test]
    fn reads_phis_with_forward_references() {
        let function = parse_function(indoc! {"
            fn pick(%c: bool) {
            .a:
                br %c .b .c
            .b:
                jmp .c
            .c:
                %p: i64 = phi [.a: 1, .b: %q]
                %q: i64 = add %p, 1
                ret %q
            }
        "})
        .unwrap();

        let phi = &function.block(BlockId::new(2)).phis[0];
        assert_eq!(phi.sources.len(), 2);
        assert_eq!(
            phi.sources[&BlockId::new(0)],
            Operand::Immediate(Immediate::Int(1))
        );
    }

    #[test]
    fn reports_undefined_values() {
        let error = parse_function(indoc! {"
            fn broken() {
            .a:
                ret %missing
            }
        "})
        .unwrap_err();

        assert_eq!(error.line, 3);
        assert!(error.message.contains("%missing"), "{}", error.message);
    }

    #[test]
    fn rejects_phi_after_instruction() {
        let error = parse_function(indoc! {"
            fn late() {
            .a:
                %x: i64 = add 1, 2
                %p: i64 = phi [.a: %x]
                ret %p
            }
        "})
        .unwrap_err();

        assert!(error.message.contains("phi"), "{}", error.message);
    }

    #[test]
    fn rejects_missing_terminator() {
        assert!(parse_function("fn f() { .a: %x: i64 = 1 }").is_err());
    }

    #[test]
    fn reads_several_functions() {
        let module = parse_module(indoc! {"
            fn first() {
            .a:
                ret
            }

            fn second(%x: bool) {
            .a:
                ret %x
            }
        "})
        .unwrap();

        assert_eq!(module.functions.len(), 2);
        assert_eq!(
            module.functions[1].block(BlockId::ZERO).terminator,
            Terminator::Return {
                value: Some(Operand::Value(ValueId::new(0)))
            }
        );
    }
}
