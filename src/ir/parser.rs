//! Hook-IR parser.
//!
//! Hand-rolled recursive descent over the textual format described in the
//! module docs. Values must be defined before use; blocks may be
//! referenced forward and are created on first mention.

use super::*;
use crate::error::{Error, Result};
use std::collections::HashSet;

pub fn parse_module(text: &str) -> Result<IrModule> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: IrModule,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser {
            text,
            pos: 0,
            module: IrModule::default(),
        }
    }

    fn parse(mut self) -> Result<IrModule> {
        self.skip_whitespace();
        while !self.is_eof() {
            let keyword = self.read_identifier()?;
            match keyword {
                "global" => self.parse_global(false)?,
                "extern" => {
                    let next = self.read_identifier()?;
                    if next != "global" {
                        return Err(self.error(format!("expected `global` after `extern`, found `{next}`")));
                    }
                    self.parse_global(true)?;
                }
                "hook" => self.parse_function(true)?,
                "func" => self.parse_function(false)?,
                other => {
                    return Err(self.error(format!("unexpected top-level keyword `{other}`")))
                }
            }
            self.skip_whitespace();
        }
        Ok(self.module)
    }

    fn parse_global(&mut self, is_extern: bool) -> Result<()> {
        self.expect('@')?;
        let name = self.read_symbol_name()?.to_string();
        self.expect(':')?;
        let ty = self.read_type()?;
        self.module.add_global(IrGlobal {
            name,
            ty,
            is_extern,
        });
        Ok(())
    }

    fn parse_function(&mut self, is_hook: bool) -> Result<()> {
        self.expect('@')?;
        let name = self.read_symbol_name()?.to_string();
        let mut func = IrFunction::new(name, is_hook);

        self.expect('(')?;
        if !self.try_read(')') {
            loop {
                self.expect('%')?;
                let pname = self.read_identifier()?.to_string();
                self.expect(':')?;
                let ty = self.read_type()?;
                func.push_value(pname, ValueDef::Arg { ty });
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect(')')?;
        }
        func.param_count = func.values.len();

        self.expect('{')?;
        let mut ctx = FuncCtx::default();
        for i in 0..func.param_count {
            ctx.values
                .insert(func.values[i].name.clone(), ValueId(i as u32));
        }

        // the body is a sequence of labelled blocks
        while !self.try_read('}') {
            let label = self.read_identifier()?.to_string();
            self.expect(':')?;
            let block = ctx.block_for(&mut func, &label);
            ctx.defined.insert(label);
            self.parse_block_body(&mut func, &mut ctx, block)?;
        }

        validate_function(&func, &ctx).map_err(|m| self.error(m))?;
        self.module.functions.push(func);
        Ok(())
    }

    fn parse_block_body(
        &mut self,
        func: &mut IrFunction,
        ctx: &mut FuncCtx,
        block: BlockId,
    ) -> Result<()> {
        loop {
            self.skip_whitespace();
            // the block ends at the next label, the closing brace, or EOF
            let mark = self.pos;
            if self.peek() == Some('}') {
                return Ok(());
            }
            if let Ok(ident) = self.read_identifier() {
                if self.try_read(':') {
                    // the label of the next block; rewind and return
                    self.pos = mark;
                    return Ok(());
                }
                self.pos = mark;
                let _ = ident;
            }
            let terminated = self.parse_inst(func, ctx, block)?;
            if terminated {
                // peek ahead; another statement in the same block would be
                // unreachable, the validator reports it via block shape
                self.skip_whitespace();
            }
            if self.is_eof() {
                return Err(self.error("unterminated function body".into()));
            }
        }
    }

    /// Parses one instruction; returns whether it was a terminator.
    fn parse_inst(&mut self, func: &mut IrFunction, ctx: &mut FuncCtx, block: BlockId) -> Result<bool> {
        if self.try_read('%') {
            // value-producing instruction
            let name = self.read_identifier()?.to_string();
            self.expect('=')?;
            let inst = self.parse_value_expr(func, ctx)?;
            let id = func.push_inst(block, name.clone(), inst);
            ctx.values.insert(name, id);
            return Ok(false);
        }

        let op = self.read_identifier()?;
        match op {
            "store" => {
                self.expect('.')?;
                let ty = self.read_type()?;
                let addr = self.read_value(ctx)?;
                self.expect(',')?;
                let value = self.read_value(ctx)?;
                func.push_inst(block, "", IrInst::Store { ty, addr, value });
                Ok(false)
            }
            "call" => {
                let inst = self.parse_call(ctx, None)?;
                func.push_inst(block, "", inst);
                Ok(false)
            }
            "br" => {
                self.expect('^')?;
                let label = self.read_identifier()?.to_string();
                let target = ctx.block_for(func, &label);
                func.push_inst(block, "", IrInst::Br { target });
                Ok(true)
            }
            "condbr" => {
                let cond = self.read_value(ctx)?;
                self.expect(',')?;
                self.expect('^')?;
                let then_label = self.read_identifier()?.to_string();
                self.expect(',')?;
                self.expect('^')?;
                let else_label = self.read_identifier()?.to_string();
                let then_target = ctx.block_for(func, &then_label);
                let else_target = ctx.block_for(func, &else_label);
                func.push_inst(
                    block,
                    "",
                    IrInst::CondBr {
                        cond,
                        then_target,
                        else_target,
                    },
                );
                Ok(true)
            }
            "ret" => {
                self.skip_inline_whitespace();
                let value = if self.peek() == Some('%') {
                    Some(self.read_value(ctx)?)
                } else {
                    None
                };
                func.push_inst(block, "", IrInst::Ret { value });
                Ok(true)
            }
            other => Err(self.error(format!("unknown statement `{other}`"))),
        }
    }

    fn parse_value_expr(&mut self, _func: &mut IrFunction, ctx: &mut FuncCtx) -> Result<IrInst> {
        let op = self.read_identifier()?;
        if op == "iconst" {
            self.expect('.')?;
            let ty = self.read_type()?;
            let value = self.read_int()?;
            return Ok(IrInst::IConst { ty, value });
        }
        if op == "load" {
            self.expect('.')?;
            let ty = self.read_type()?;
            let addr = self.read_value(ctx)?;
            return Ok(IrInst::Load { ty, addr });
        }
        if op == "addrof" {
            self.expect('@')?;
            let global = self.read_symbol_name()?.to_string();
            return Ok(IrInst::AddrOf { global });
        }
        if op == "call" {
            let ty = if self.try_read('.') {
                Some(self.read_type()?)
            } else {
                None
            };
            return self.parse_call(ctx, ty);
        }
        if let Some(bin) = BinOp::parse(op) {
            self.expect('.')?;
            let ty = self.read_type()?;
            let lhs = self.read_value(ctx)?;
            self.expect(',')?;
            let rhs = self.read_value(ctx)?;
            return Ok(IrInst::Bin {
                op: bin,
                ty,
                lhs,
                rhs,
            });
        }
        Err(self.error(format!("unknown operation `{op}`")))
    }

    fn parse_call(&mut self, ctx: &mut FuncCtx, ty: Option<Type>) -> Result<IrInst> {
        self.expect('@')?;
        let callee = self.read_symbol_name()?.to_string();
        self.expect('(')?;
        let mut args = Vec::new();
        if !self.try_read(')') {
            loop {
                args.push(self.read_value(ctx)?);
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect(')')?;
        }
        Ok(IrInst::Call { callee, args, ty })
    }

    fn read_value(&mut self, ctx: &FuncCtx) -> Result<ValueId> {
        self.expect('%')?;
        let name = self.read_identifier()?;
        ctx.values
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("use of undefined value `%{name}`")))
    }

    fn read_type(&mut self) -> Result<Type> {
        let name = self.read_identifier()?;
        Type::parse(name).ok_or_else(|| self.error(format!("unknown type `{name}`")))
    }

    // lexer helpers

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == ';' {
                while let Some(c) = self.peek() {
                    self.advance();
                    if c == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_inline_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == ' ' || ch == '\t' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!("expected `{ch}`, found {:?}", self.peek())));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> Result<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            other => return Err(self.error(format!("expected identifier, found {other:?}"))),
        }
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    /// Like [`read_identifier`], but dots are allowed: symbol names such
    /// as `my.readReg32` use them.
    fn read_symbol_name(&mut self) -> Result<&'a str> {
        let start = {
            self.skip_whitespace();
            self.pos
        };
        match self.peek() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            other => return Err(self.error(format!("expected symbol name, found {other:?}"))),
        }
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_int(&mut self) -> Result<i64> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek() == Some('-') {
            self.advance();
        }
        if self.text[self.pos..].starts_with("0x") {
            self.advance();
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let body = &self.text[start..self.pos];
            let (negative, digits) = match body.strip_prefix('-') {
                Some(rest) => (true, &rest[2..]),
                None => (false, &body[2..]),
            };
            let value = i64::from_str_radix(digits, 16)
                .map_err(|_| self.error(format!("bad integer `{body}`")))?;
            return Ok(if negative { -value } else { value });
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let body = &self.text[start..self.pos];
        body.parse::<i64>()
            .map_err(|_| self.error(format!("bad integer `{body}`")))
    }

    fn error(&self, message: String) -> Error {
        let line = self.text[..self.pos.min(self.text.len())]
            .chars()
            .filter(|&c| c == '\n')
            .count()
            + 1;
        Error::lift(format!("hook IR parse error at line {line}: {message}"))
    }
}

#[derive(Default)]
struct FuncCtx {
    values: std::collections::HashMap<String, ValueId>,
    blocks: std::collections::HashMap<String, BlockId>,
    defined: HashSet<String>,
}

impl FuncCtx {
    fn block_for(&mut self, func: &mut IrFunction, label: &str) -> BlockId {
        if let Some(id) = self.blocks.get(label) {
            return *id;
        }
        let id = func.add_block(label);
        self.blocks.insert(label.to_string(), id);
        id
    }
}

fn validate_function(func: &IrFunction, ctx: &FuncCtx) -> std::result::Result<(), String> {
    if func.blocks.is_empty() {
        return Err(format!("function `{}` has no blocks", func.name));
    }
    for block in &func.blocks {
        if !ctx.defined.contains(&block.name) {
            return Err(format!(
                "function `{}` branches to undefined block `^{}`",
                func.name, block.name
            ));
        }
        let terminated = block
            .insts
            .last()
            .map(|id| match &func.value(*id).def {
                ValueDef::Inst(inst) => inst.is_terminator(),
                ValueDef::Arg { .. } => false,
            })
            .unwrap_or(false);
        if !terminated {
            return Err(format!(
                "block `^{}` of `{}` does not end in a terminator",
                block.name, func.name
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hook_with_branching() {
        let text = r#"
; counting hook
global @counter : i64
hook @count(%n: i32) {
entry:
    %zero = iconst.i32 0
    %is_zero = xor.i32 %n, %zero
    condbr %is_zero, ^bump, ^done
bump:
    %addr = addrof @counter
    %wide = call.i64 @sAtomicAdd(%addr, %n)
    br ^done
done:
    ret
}
"#;
        let module = parse_module(text).unwrap();
        assert_eq!(module.globals.len(), 1);
        let hook = module.function("count").unwrap();
        assert!(hook.is_hook);
        assert_eq!(hook.param_count, 1);
        assert_eq!(hook.blocks.len(), 3);
        assert_eq!(hook.callees().len(), 1);
        assert!(hook.referenced_globals().contains("counter"));
    }

    #[test]
    fn rejects_undefined_value() {
        let text = "hook @h() {\nentry:\n %a = add.i32 %b, %b\n ret\n}\n";
        assert!(parse_module(text).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        let text = "hook @h() {\nentry:\n %a = iconst.i32 1\n}\n";
        assert!(parse_module(text).is_err());
    }

    #[test]
    fn rejects_undefined_block() {
        let text = "hook @h() {\nentry:\n br ^nowhere\n}\n";
        assert!(parse_module(text).is_err());
    }

    #[test]
    fn parses_extern_global_and_func(){
        let text = "extern global @buf : ptr\nfunc @helper(%x: i64) {\nentry:\n ret %x\n}\n";
        let module = parse_module(text).unwrap();
        assert!(module.global("buf").unwrap().is_extern);
        assert!(!module.function("helper").unwrap().is_hook);
    }

    #[test]
    fn hex_and_negative_integers() {
        let text = "hook @h() {\nentry:\n %a = iconst.i64 0x10\n %b = iconst.i32 -3\n ret\n}\n";
        let module = parse_module(text).unwrap();
        let h = module.function("h").unwrap();
        match &h.value(ValueId(0)).def {
            ValueDef::Inst(IrInst::IConst { value, .. }) => assert_eq!(*value, 16),
            other => panic!("unexpected {other:?}"),
        }
        match &h.value(ValueId(1)).def {
            ValueDef::Inst(IrInst::IConst { value, .. }) => assert_eq!(*value, -3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
