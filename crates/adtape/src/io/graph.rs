//! Graphviz DOT output for inspecting a tape.

use super::TapeWriter;
use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::real::Real;
use crate::tape::{Statement, Tape, TapeKind};
use log::debug;
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::io::Write;

/// Writes the data flow of a tape as a DOT digraph.
///
/// Every statement becomes a node labelled with its output handle; edges
/// run from the statement that last wrote an argument to its consumer and
/// carry the partial (Jacobian statements) or the operand slot (operation
/// statements). Inputs and outputs are marked in their labels. External
/// function markers appear as unconnected nodes.
#[derive(Debug)]
pub struct GraphWriter<W: Write> {
    writer: W,
}

impl<W: Write> GraphWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TapeWriter for GraphWriter<W> {
    fn write<T: Real, I: IndexManager>(&mut self, tape: &Tape<T, I>) -> Result<(), TapeError> {
        let mut graph: DiGraph<String, String> = DiGraph::new();
        // Latest node that wrote each handle. Reuse tapes overwrite handles.
        let mut writers: HashMap<Identifier, NodeIndex> = HashMap::new();
        // Primal-value tapes carry their own input statements.
        if tape.kind() == TapeKind::Jacobian {
            for &input in tape.inputs() {
                let node = graph.add_node(format!("input {input}"));
                writers.insert(input, node);
            }
        }

        let mut externals = tape.externals.iter();
        tape.visit_forward(|view| {
            let label = match *view.statement {
                Statement::Input { lhs, value, .. } => format!("input {lhs} = {value}"),
                Statement::Jacobian { lhs, primal, .. } => format!("{lhs} = {primal}"),
                Statement::Operation { lhs, op, .. } => format!("{lhs} = {op}"),
                Statement::External => {
                    let name = externals.next().map_or("?", |record| record.name());
                    graph.add_node(format!("external {name}"));
                    return;
                }
            };
            let node = graph.add_node(label);
            let by_operand = matches!(view.statement, Statement::Operation { .. });
            for (slot, &id) in view.arguments.iter().enumerate() {
                let Some(&source) = writers.get(&id) else {
                    continue;
                };
                let weight = if by_operand {
                    format!("#{slot}")
                } else {
                    view.values[slot].to_string()
                };
                graph.add_edge(source, node, weight);
            }
            if let Some(lhs) = view.statement.lhs() {
                writers.insert(lhs, node);
            }
        });

        for &output in tape.outputs() {
            if let Some(&node) = writers.get(&output) {
                graph[node].push_str(" (output)");
            }
        }

        write!(self.writer, "{}", Dot::new(&graph))?;
        self.writer.flush()?;
        debug!(
            "graph writer stored {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(())
    }
}
