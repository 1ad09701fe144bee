use std::collections::{BTreeMap, HashMap, HashSet};

use crate::data::annotation::AnnotationTable;

/// Undirected compound-compound links of a biochemical network.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BioNetwork {
    neighbours: HashMap<String, HashSet<String>>,
}

impl BioNetwork {
    /// Self links are dropped.
    pub fn new<I, A, B>(links: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut neighbours: HashMap<String, HashSet<String>> = HashMap::new();
        for (a, b) in links {
            let (a, b) = (a.into(), b.into());
            if a == b {
                continue;
            }
            neighbours.entry(a.clone()).or_default().insert(b.clone());
            neighbours.entry(b).or_default().insert(a);
        }
        BioNetwork { neighbours }
    }

    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.neighbours.get(a).is_some_and(|n| n.contains(b))
    }

    pub fn neighbours(&self, compound: &str) -> impl Iterator<Item = &str> {
        self.neighbours.get(compound).into_iter().flatten().map(String::as_str)
    }

    pub fn num_links(&self) -> usize {
        self.neighbours.values().map(HashSet::len).sum::<usize>() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }
}

/// A row of one annotation table, addressed by table and row index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef {
    pub group: usize,
    pub row: usize,
}

/// Compatibility edges between rows of different tables, stored per row in
/// a flat arena. Row `r` of table `g` lives at `offsets[g] + r`.
#[derive(Clone, Debug, Default)]
pub struct RelationGraph {
    offsets: Vec<usize>,
    adduct: Vec<Vec<RowRef>>,
    biochemical: Vec<Vec<RowRef>>,
}

impl RelationGraph {
    /// Build the edge lists.
    ///
    /// With `adducts`, rows of tables in the same correlation cluster are
    /// linked when they name the same compound with different adducts.
    /// With a `network`, rows of different tables are linked when their
    /// compounds are neighbours; compounds absent from every table are ignored.
    pub fn build(tables: &[AnnotationTable], adducts: bool, network: Option<&BioNetwork>) -> Self {
        let mut offsets = Vec::with_capacity(tables.len());
        let mut total = 0;
        for table in tables {
            offsets.push(total);
            total += table.len();
        }
        let mut graph = RelationGraph {
            offsets,
            adduct: vec![Vec::new(); total],
            biochemical: vec![Vec::new(); total],
        };

        if adducts {
            graph.link_adducts(tables);
        }
        if let Some(network) = network {
            graph.link_network(tables, network);
        }
        graph
    }

    fn slot(&self, at: RowRef) -> usize {
        self.offsets[at.group] + at.row
    }

    fn link_adducts(&mut self, tables: &[AnnotationTable]) {
        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (g, table) in tables.iter().enumerate() {
            clusters.entry(table.cluster_id).or_default().push(g);
        }

        for members in clusters.values().filter(|m| m.len() > 1) {
            for &g in members {
                for (r, row) in tables[g].rows.iter().enumerate() {
                    let Some(hypothesis) = &row.hypothesis else { continue };
                    let mut edges = Vec::new();
                    for &h in members.iter().filter(|&&h| h != g) {
                        for (s, other) in tables[h].rows.iter().enumerate() {
                            let compatible = other.hypothesis.as_ref().is_some_and(|o| {
                                o.compound_id == hypothesis.compound_id && o.adduct != hypothesis.adduct
                            });
                            if compatible {
                                edges.push(RowRef { group: h, row: s });
                            }
                        }
                    }
                    let slot = self.slot(RowRef { group: g, row: r });
                    self.adduct[slot] = edges;
                }
            }
        }
    }

    fn link_network(&mut self, tables: &[AnnotationTable], network: &BioNetwork) {
        let mut rows_of: HashMap<&str, Vec<RowRef>> = HashMap::new();
        for (g, table) in tables.iter().enumerate() {
            for (r, row) in table.rows.iter().enumerate() {
                if let Some(compound) = row.compound_id() {
                    rows_of.entry(compound).or_default().push(RowRef { group: g, row: r });
                }
            }
        }

        for (g, table) in tables.iter().enumerate() {
            for (r, row) in table.rows.iter().enumerate() {
                let Some(compound) = row.compound_id() else { continue };
                let mut edges: Vec<RowRef> = network
                    .neighbours(compound)
                    .filter_map(|n| rows_of.get(n))
                    .flatten()
                    .filter(|other| other.group != g)
                    .copied()
                    .collect();
                edges.sort();
                let slot = self.slot(RowRef { group: g, row: r });
                self.biochemical[slot] = edges;
            }
        }
    }

    pub fn adduct_edges(&self, at: RowRef) -> &[RowRef] {
        &self.adduct[self.slot(at)]
    }

    pub fn biochemical_edges(&self, at: RowRef) -> &[RowRef] {
        &self.biochemical[self.slot(at)]
    }

    /// number of adduct edges and biochemical edges of `at` that end in the
    /// currently assigned row of their table
    pub fn active_counts(&self, at: RowRef, assignment: &[usize]) -> (usize, usize) {
        let active = |edges: &[RowRef]| edges.iter().filter(|e| assignment[e.group] == e.row).count();
        (active(self.adduct_edges(at)), active(self.biochemical_edges(at)))
    }

    pub fn num_edges(&self) -> (usize, usize) {
        (
            self.adduct.iter().map(Vec::len).sum(),
            self.biochemical.iter().map(Vec::len).sum(),
        )
    }
}
