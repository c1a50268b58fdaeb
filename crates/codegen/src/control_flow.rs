//! Control-flow and statement visitors
//!
//! Every structured statement is emitted inside a stack-height checkpoint:
//! whatever a statement pushes it must also pop. `return` is the one visitor
//! that bends the rule — its POPs run at most once at runtime, so the virtual
//! height is restored afterwards to keep the surrounding checkpoints honest.

use crate::{compiler::ContractCompiler, context::StackHeightChecker, error::Result, utils};
use covenant_ast::{Expr, SourceLocation, Stmt, StmtKind, VarId};
use evm_glue::opcodes::Opcode;

impl<'a> ContractCompiler<'a> {
    pub(crate) fn visit_statement(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Block(statements) => self.with_location(stmt.loc, |this| {
                for statement in statements {
                    this.visit_statement(statement)?;
                }
                Ok(())
            }),
            StmtKind::If { condition, then_branch, else_branch } => {
                self.visit_if(stmt.loc, condition, then_branch, else_branch.as_deref())
            }
            StmtKind::While { condition, body } => self.visit_while(stmt.loc, condition, body),
            StmtKind::For { init, condition, step, body } => {
                self.visit_for(stmt.loc, init.as_deref(), condition.as_ref(), step.as_deref(), body)
            }
            StmtKind::Continue => self.visit_continue(stmt.loc),
            StmtKind::Break => self.visit_break(stmt.loc),
            StmtKind::Return(value) => self.visit_return(stmt.loc, value.as_ref()),
            StmtKind::VariableDeclaration { var, value } => {
                self.visit_variable_declaration(stmt.loc, *var, value.as_ref())
            }
            StmtKind::Expression(expr) => self.visit_expression_statement(stmt.loc, expr),
            StmtKind::Placeholder => self.visit_placeholder(stmt.loc),
        }
    }

    fn visit_if(
        &mut self,
        loc: SourceLocation,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
    ) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            this.compile_expression(condition, None)?;
            let true_tag = this.context.append_conditional_jump();
            if let Some(else_branch) = else_branch {
                this.visit_statement(else_branch)?;
            }
            let end_tag = this.context.append_jump_to_new();
            this.context.append_tag(true_tag);
            this.visit_statement(then_branch)?;
            this.context.append_tag(end_tag);
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }

    fn visit_while(&mut self, loc: SourceLocation, condition: &Expr, body: &Stmt) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            let loop_start = this.context.new_tag();
            let loop_end = this.context.new_tag();
            this.continue_tags.push(loop_start);
            this.break_tags.push(loop_end);

            this.context.append_tag(loop_start);
            this.compile_expression(condition, None)?;
            this.context.append_op(Opcode::ISZERO);
            this.context.append_conditional_jump_to(loop_end);

            this.visit_statement(body)?;

            this.context.append_jump_to(loop_start);
            this.context.append_tag(loop_end);

            this.continue_tags.pop();
            this.break_tags.pop();
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }

    fn visit_for(
        &mut self,
        loc: SourceLocation,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Stmt,
    ) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            let loop_start = this.context.new_tag();
            let loop_end = this.context.new_tag();
            // `continue` re-evaluates the condition; the step expression runs
            // only on the fall-through path.
            this.continue_tags.push(loop_start);
            this.break_tags.push(loop_end);

            if let Some(init) = init {
                this.visit_statement(init)?;
            }

            this.context.append_tag(loop_start);

            // an absent condition means the loop condition is always true
            if let Some(condition) = condition {
                this.compile_expression(condition, None)?;
                this.context.append_op(Opcode::ISZERO);
                this.context.append_conditional_jump_to(loop_end);
            }

            this.visit_statement(body)?;

            if let Some(step) = step {
                this.visit_statement(step)?;
            }

            this.context.append_jump_to(loop_start);
            this.context.append_tag(loop_end);

            this.continue_tags.pop();
            this.break_tags.pop();
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }

    fn visit_continue(&mut self, loc: SourceLocation) -> Result<()> {
        self.with_location(loc, |this| {
            // Outside a loop the type checker already rejected the statement.
            if let Some(&tag) = this.continue_tags.last() {
                this.context.append_jump_to(tag);
            }
            Ok(())
        })
    }

    fn visit_break(&mut self, loc: SourceLocation) -> Result<()> {
        self.with_location(loc, |this| {
            if let Some(&tag) = this.break_tags.last() {
                this.context.append_jump_to(tag);
            }
            Ok(())
        })
    }

    fn visit_return(&mut self, loc: SourceLocation, value: Option<&Expr>) -> Result<()> {
        self.with_location(loc, |this| {
            if let Some(expr) = value {
                let unit = this.unit;
                let function =
                    this.current_function.expect("return statement outside a function");
                let first = *unit.functions[function]
                    .returns
                    .first()
                    .expect("return statement with a value in a function returning nothing");
                // Only the first return variable receives the value; further
                // return variables keep their zero initialization.
                this.compile_expression(expr, Some(unit.variables[first].ty))?;
                utils::move_to_stack_variable(&mut this.context, unit, first)?;
            }
            // Unwind the frames of every enclosing modifier, then leave
            // through the function's single exit point.
            for _ in 0..this.stack_cleanup_for_return {
                this.context.append_op(Opcode::POP);
            }
            this.context.append_jump_to(this.return_tag);
            // The POPs run at most once at runtime; tracking continues as if
            // they had not happened.
            this.context.adjust_stack_offset(this.stack_cleanup_for_return as i32);
            Ok(())
        })
    }

    fn visit_variable_declaration(
        &mut self,
        loc: SourceLocation,
        var: VarId,
        value: Option<&Expr>,
    ) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            // The slot was zero-initialized at function entry; without an
            // initializer there is nothing to emit.
            if let Some(expr) = value {
                let unit = this.unit;
                this.compile_expression(expr, Some(unit.variables[var].ty))?;
                utils::move_to_stack_variable(&mut this.context, unit, var)?;
            }
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }

    fn visit_expression_statement(&mut self, loc: SourceLocation, expr: &Expr) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            this.compile_expression(expr, None)?;
            if let Some(ty) = expr.ty(this.unit) {
                utils::pop_stack_element(&mut this.context, ty);
            }
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }

    fn visit_placeholder(&mut self, loc: SourceLocation) -> Result<()> {
        let checker = StackHeightChecker::new(&self.context);
        self.with_location(loc, |this| {
            this.modifier_depth += 1;
            this.append_modifier_or_function_code()?;
            this.modifier_depth -= 1;
            Ok(())
        })?;
        checker.check(&self.context);
        Ok(())
    }
}
