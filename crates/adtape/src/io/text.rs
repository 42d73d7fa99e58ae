//! Line oriented text format.
//!
//! ```text
//! adtape-text 1
//! kind primal-value
//! inputs 2 1 2
//! outputs 1 4
//! statements 4
//! I 1 3
//! I 2 0.5
//! O 3 mul 1 2
//! J 4 1.5 1 3 1
//! ```
//!
//! Records: `I lhs value` (input), `J lhs primal n (id partial)*`
//! (Jacobian statement) and `O lhs op ids* values*` (operation statement;
//! passive operands are written as handle `0` and their values follow the
//! constants). External function markers are not persisted.

use super::{LoadedTape, TapeReader, TapeWriter};
use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::operation::Operation;
use crate::real::Real;
use crate::tape::{Statement, StatementView, Tape, TapeConfig, TapeKind};
use log::{debug, warn};
use std::io::{self, BufRead, Write};
use std::str::{FromStr, SplitWhitespace};

const MAGIC: &str = "adtape-text";
const VERSION: u32 = 1;

/// Writes a tape in the text format.
#[derive(Debug)]
pub struct TextWriter<W: Write> {
    writer: W,
}

impl<W: Write> TextWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TapeWriter for TextWriter<W> {
    fn write<T: Real, I: IndexManager>(&mut self, tape: &Tape<T, I>) -> Result<(), TapeError> {
        let stats = tape.statistics();
        if stats.external_functions > 0 {
            warn!(
                "text writer skips {} external function markers",
                stats.external_functions
            );
        }
        let w = &mut self.writer;
        writeln!(w, "{MAGIC} {VERSION}")?;
        writeln!(w, "kind {}", tape.kind())?;
        write_handles(w, "inputs", tape.inputs())?;
        write_handles(w, "outputs", tape.outputs())?;
        writeln!(w, "statements {}", stats.statements - stats.external_functions)?;

        let mut result = Ok(());
        tape.visit_forward(|view| {
            if result.is_ok() {
                result = write_record(w, view);
            }
        });
        result?;
        w.flush()?;
        debug!("text writer stored {} statements", stats.statements);
        Ok(())
    }
}

fn write_handles<W: Write>(w: &mut W, label: &str, ids: &[Identifier]) -> io::Result<()> {
    write!(w, "{label} {}", ids.len())?;
    for id in ids {
        write!(w, " {id}")?;
    }
    writeln!(w)
}

fn write_record<W: Write, T: Real>(w: &mut W, view: StatementView<'_, T>) -> io::Result<()> {
    match *view.statement {
        Statement::Input { lhs, value, .. } => writeln!(w, "I {lhs} {value}"),
        Statement::Jacobian {
            lhs,
            arg_count,
            primal,
            ..
        } => {
            write!(w, "J {lhs} {primal} {arg_count}")?;
            for (id, partial) in view.arguments.iter().zip(view.values) {
                write!(w, " {id} {partial}")?;
            }
            writeln!(w)
        }
        Statement::Operation { lhs, op, .. } => {
            write!(w, "O {lhs} {op}")?;
            for id in view.arguments {
                write!(w, " {id}")?;
            }
            for value in view.values {
                write!(w, " {value}")?;
            }
            writeln!(w)
        }
        Statement::External => Ok(()),
    }
}

/// Reads a tape written by [`TextWriter`].
#[derive(Debug)]
pub struct TextReader<R: BufRead> {
    reader: R,
    line: usize,
}

impl<R: BufRead> TextReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }

    fn next_line(&mut self) -> Result<String, TapeError> {
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if self.reader.read_line(&mut buffer)? == 0 {
                return Err(TapeError::format(self.line, "unexpected end of input"));
            }
            self.line += 1;
            if !buffer.trim().is_empty() {
                return Ok(buffer);
            }
        }
    }

    fn header(&mut self, keyword: &str) -> Result<Record, TapeError> {
        let line = self.next_line()?;
        let mut record = Record::new(line, self.line);
        record.keyword(keyword)?;
        Ok(record)
    }

    fn handles(&mut self, keyword: &str) -> Result<Vec<Identifier>, TapeError> {
        let mut record = self.header(keyword)?;
        let count: usize = record.parse("handle count")?;
        let ids = (0..count)
            .map(|_| record.identifier())
            .collect::<Result<Vec<_>, _>>()?;
        record.finish()?;
        Ok(ids)
    }

    fn statement<T: Real, I: IndexManager>(&mut self, tape: &mut Tape<T, I>) -> Result<(), TapeError> {
        let line = self.next_line()?;
        let mut record = Record::new(line, self.line);
        let tag: String = record.parse("record tag")?;
        let kind = tape.kind();
        match tag.as_str() {
            "J" => {
                let lhs = record.output()?;
                let primal: T = record.parse("primal")?;
                let count: usize = record.parse("argument count")?;
                let arg_count = u16::try_from(count)
                    .map_err(|_| record.error(format!("{count} arguments do not fit a statement")))?;
                let mut ids = Vec::with_capacity(count);
                let mut partials = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(record.identifier()?);
                    partials.push(record.parse::<T>("partial")?);
                }
                record.finish()?;
                let statement = Statement::Jacobian {
                    lhs,
                    arg_count,
                    primal,
                    old_primal: T::zero(),
                };
                tape.restore_statement(statement, primal, &ids, &partials)
            }
            "I" if kind == TapeKind::PrimalValue => {
                let lhs = record.output()?;
                let value: T = record.parse("input value")?;
                record.finish()?;
                let statement = Statement::Input {
                    lhs,
                    value,
                    old_primal: T::zero(),
                };
                tape.restore_statement(statement, value, &[], &[])
            }
            "O" if kind == TapeKind::PrimalValue => {
                let lhs = record.output()?;
                let op: Operation = record.parse("operation")?;
                let ids = (0..op.arity())
                    .map(|_| record.identifier())
                    .collect::<Result<Vec<_>, _>>()?;
                let passive_count = ids.iter().filter(|id| !id.is_active()).count();
                let values = (0..op.constant_count() + passive_count)
                    .map(|_| record.parse::<T>("operand value"))
                    .collect::<Result<Vec<_>, _>>()?;
                record.finish()?;
                let statement = Statement::Operation {
                    lhs,
                    op,
                    passive_count: passive_count as u8,
                    old_primal: T::zero(),
                };
                tape.restore_statement(statement, T::zero(), &ids, &values)
            }
            other => Err(record.error(format!("unexpected '{other}' record on a {kind} tape"))),
        }
    }
}

impl<R: BufRead> TapeReader for TextReader<R> {
    fn read<T: Real, I: IndexManager>(
        &mut self,
        config: TapeConfig,
    ) -> Result<LoadedTape<T, I>, TapeError> {
        let mut magic = self.header(MAGIC)?;
        let version: u32 = magic.parse("version")?;
        if version != VERSION {
            return Err(magic.error(format!("unsupported version {version}")));
        }
        magic.finish()?;

        let mut kind = self.header("kind")?;
        let found: String = kind.parse("tape kind")?;
        kind.finish()?;
        if found != config.kind.name() {
            return Err(TapeError::KindMismatch {
                expected: config.kind.to_string(),
                found,
            });
        }

        let inputs = self.handles("inputs")?;
        let outputs = self.handles("outputs")?;
        let mut count = self.header("statements")?;
        let statements: usize = count.parse("statement count")?;
        count.finish()?;

        let mut tape: Tape<T, I> = Tape::new(config);
        for &id in &inputs {
            tape.indices.reserve(id)?;
        }
        for _ in 0..statements {
            self.statement(&mut tape)?;
        }
        for &id in &outputs {
            tape.indices.reserve(id)?;
            tape.registered_outputs.insert(id);
        }
        tape.inputs.clone_from(&inputs);
        tape.outputs.clone_from(&outputs);
        if config.kind == TapeKind::PrimalValue {
            tape.evaluate_primal()?;
        }
        debug!("text reader loaded {statements} statements");
        Ok(LoadedTape {
            tape,
            inputs,
            outputs,
        })
    }
}

/// Tokenizer over one line with its line number for error messages.
struct Record {
    text: String,
    offset: usize,
    line: usize,
}

impl Record {
    fn new(text: String, line: usize) -> Self {
        Self {
            text,
            offset: 0,
            line,
        }
    }

    fn error(&self, message: impl Into<String>) -> TapeError {
        TapeError::format(self.line, message)
    }

    fn tokens(&self) -> SplitWhitespace<'_> {
        self.text[self.offset..].split_whitespace()
    }

    fn token(&mut self, what: &str) -> Result<String, TapeError> {
        let rest = &self.text[self.offset..];
        let start = rest.len() - rest.trim_start().len();
        let token = rest[start..]
            .split_whitespace()
            .next()
            .ok_or_else(|| self.error(format!("missing {what}")))?
            .to_string();
        self.offset += start + token.len();
        Ok(token)
    }

    fn parse<V: FromStr>(&mut self, what: &str) -> Result<V, TapeError> {
        let token = self.token(what)?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {what} '{token}'")))
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), TapeError> {
        let token = self.token(keyword)?;
        if token != keyword {
            return Err(self.error(format!("expected '{keyword}', found '{token}'")));
        }
        Ok(())
    }

    fn identifier(&mut self) -> Result<Identifier, TapeError> {
        self.parse::<u32>("handle").map(Identifier::new)
    }

    fn output(&mut self) -> Result<Identifier, TapeError> {
        let id = self.identifier()?;
        if !id.is_active() {
            return Err(self.error("statement output is passive"));
        }
        Ok(id)
    }

    fn finish(&self) -> Result<(), TapeError> {
        match self.tokens().next() {
            Some(extra) => Err(self.error(format!("unexpected trailing '{extra}'"))),
            None => Ok(()),
        }
    }
}
