// src/traverse.rs
//
// Recorrido en profundidad (pre-orden) del árbol de directorios.
//
// Cada nodo pasa por Pending -> Visiting -> Done. La pila es explícita, así
// que una imagen con ciclos no desborda la pila del proceso, pero sin
// `detect_cycles` ni `max_depth` el recorrido no termina: la imagen no trae
// información para distinguir un ciclo de un árbol profundo y el recorrido
// por defecto no deduplica inodos.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::dir::{decode_entries, resolve_directory, DirectoryEntry, FileTypeTag};
use crate::error::DecodeError;
use crate::group::GroupDescriptor;
use crate::inode::Inode;
use crate::layout::{DIRECT_BLOCKS, ROOT_INO};
use crate::source::{read_block, ByteSource};
use crate::superblock::Superblock;

#[derive(Debug, Clone, Default)]
pub struct TraversalOptions {
    /// Profundidad máxima a la que se desciende (la raíz es 0).
    pub max_depth: Option<usize>,
    /// No volver a entrar a un directorio ya visitado.
    pub detect_cycles: bool,
    /// Reportar también `.` y `..` como caminos (nunca se desciende por ellos).
    pub include_dot_entries: bool,
}

/// Una entrada usada encontrada en el recorrido.
#[derive(Debug, Clone, Serialize)]
pub struct Visit {
    pub path: String,
    pub entry: DirectoryEntry,
    pub depth: usize,
}

#[derive(Debug, Error)]
pub enum DiagnosticKind {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("directorio ya visitado (ciclo), no se desciende")]
    CycleSkipped,
    #[error("profundidad máxima {0} alcanzada, no se desciende")]
    DepthLimit(usize),
}

/// Problema local a una rama o a un bloque; el recorrido sigue con los
/// hermanos.
#[derive(Debug, Serialize)]
pub struct Diagnostic {
    pub path: String,
    pub inode: u32,
    pub block: Option<u32>,
    #[serde(serialize_with = "as_display")]
    pub kind: DiagnosticKind,
}

fn as_display<T: Display, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

#[derive(Debug)]
pub enum TraversalEvent {
    Entry(Visit),
    Diagnostic(Diagnostic),
}

enum Node {
    Pending {
        ino: u32,
        path: String,
        depth: usize,
    },
    Visiting(Frame),
}

struct Frame {
    ino: u32,
    path: String,
    depth: usize,
    inode: Inode,
    next_pointer: usize,
    block: u32,
    entries: std::vec::IntoIter<Result<DirectoryEntry, DecodeError>>,
}

/// Iterador del recorrido. Cada llamada a `next` vuelve a leer la fuente lo
/// justo para producir el siguiente evento.
pub struct Traverser<'a, S: ?Sized> {
    source: &'a S,
    sb: &'a Superblock,
    groups: &'a [GroupDescriptor],
    options: TraversalOptions,
    stack: Vec<Node>,
    visited: HashSet<u32>,
    queued: VecDeque<TraversalEvent>,
}

impl<'a, S: ByteSource + ?Sized> Traverser<'a, S> {
    /// Recorrido que empieza en la raíz (inodo 2, camino "/").
    pub fn new(
        source: &'a S,
        sb: &'a Superblock,
        groups: &'a [GroupDescriptor],
        options: TraversalOptions,
    ) -> Self {
        Self::from_inode(source, sb, groups, ROOT_INO, "/", options)
    }

    pub fn from_inode(
        source: &'a S,
        sb: &'a Superblock,
        groups: &'a [GroupDescriptor],
        ino: u32,
        path: &str,
        options: TraversalOptions,
    ) -> Self {
        Self {
            source,
            sb,
            groups,
            options,
            stack: vec![Node::Pending {
                ino,
                path: path.to_string(),
                depth: 0,
            }],
            visited: HashSet::new(),
            queued: VecDeque::new(),
        }
    }

    fn diagnostic(path: &str, inode: u32, block: Option<u32>, kind: DiagnosticKind) -> TraversalEvent {
        TraversalEvent::Diagnostic(Diagnostic {
            path: path.to_string(),
            inode,
            block,
            kind,
        })
    }

    /// Pending -> Visiting. Devuelve un diagnóstico si la rama termina aquí.
    fn enter(&mut self, ino: u32, path: String, depth: usize) -> Option<TraversalEvent> {
        if self.options.detect_cycles && !self.visited.insert(ino) {
            return Some(Self::diagnostic(&path, ino, None, DiagnosticKind::CycleSkipped));
        }

        match resolve_directory(self.source, self.sb, self.groups, ino) {
            Ok(inode) => {
                debug!(ino, path = %path, "entrando a directorio");
                self.stack.push(Node::Visiting(Frame {
                    ino,
                    path,
                    depth,
                    inode,
                    next_pointer: 0,
                    block: 0,
                    entries: Vec::new().into_iter(),
                }));
                None
            }
            Err(e) => Some(Self::diagnostic(&path, ino, None, e.into())),
        }
    }

    /// Avanza el directorio del tope. `None` significa "seguir iterando".
    fn step(&mut self, mut frame: Frame) -> Option<TraversalEvent> {
        let Some(item) = frame.entries.next() else {
            // Bloque agotado: pasar al siguiente puntero directo o terminar.
            let ptr = frame.inode.block[..DIRECT_BLOCKS]
                .get(frame.next_pointer)
                .copied()
                .unwrap_or(0);
            if ptr == 0 {
                return None; // Done
            }
            frame.next_pointer += 1;
            frame.block = ptr;

            let event = match read_block(self.source, self.sb.block_size, ptr) {
                Ok(data) => {
                    frame.entries = decode_entries(&data).collect::<Vec<_>>().into_iter();
                    None
                }
                Err(e) => Some(Self::diagnostic(&frame.path, frame.ino, Some(ptr), e.into())),
            };
            self.stack.push(Node::Visiting(frame));
            return event;
        };

        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let event = Self::diagnostic(&frame.path, frame.ino, Some(frame.block), e.into());
                self.stack.push(Node::Visiting(frame));
                return Some(event);
            }
        };

        if !entry.is_used() || (entry.is_dot() && !self.options.include_dot_entries) {
            self.stack.push(Node::Visiting(frame));
            return None;
        }

        let path = join_path(&frame.path, &entry.name_str());
        let depth = frame.depth;
        let descend = entry.file_type == FileTypeTag::Directory && !entry.is_dot();
        let child = entry.inode;
        self.stack.push(Node::Visiting(frame));

        if descend {
            match self.options.max_depth {
                Some(max) if depth + 1 > max => {
                    self.queued.push_back(Self::diagnostic(
                        &path,
                        child,
                        None,
                        DiagnosticKind::DepthLimit(max),
                    ));
                }
                _ => self.stack.push(Node::Pending {
                    ino: child,
                    path: path.clone(),
                    depth: depth + 1,
                }),
            }
        }

        Some(TraversalEvent::Entry(Visit {
            path,
            entry,
            depth: depth + 1,
        }))
    }
}

impl<S: ByteSource + ?Sized> Iterator for Traverser<'_, S> {
    type Item = TraversalEvent;

    fn next(&mut self) -> Option<TraversalEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }

            let event = match self.stack.pop()? {
                Node::Pending { ino, path, depth } => self.enter(ino, path, depth),
                Node::Visiting(frame) => self.step(frame),
            };
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Resultado completo de un recorrido.
#[derive(Debug, Default, Serialize)]
pub struct Traversal {
    pub visits: Vec<Visit>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Traversal {
    pub fn paths(&self) -> Vec<&str> {
        self.visits.iter().map(|v| v.path.as_str()).collect()
    }
}

/// Recorre todo el árbol desde la raíz y junta los eventos.
pub fn walk<S: ByteSource + ?Sized>(
    source: &S,
    sb: &Superblock,
    groups: &[GroupDescriptor],
    options: TraversalOptions,
) -> Traversal {
    let mut out = Traversal::default();
    for event in Traverser::new(source, sb, groups, options) {
        match event {
            TraversalEvent::Entry(v) => out.visits.push(v),
            TraversalEvent::Diagnostic(d) => out.diagnostics.push(d),
        }
    }
    out
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::read_group_descriptors;
    use crate::layout::EXT2_FT_DIR;
    use crate::mkimage::ImageBuilder;
    use crate::superblock::read_superblock;

    fn run(img: &[u8], options: TraversalOptions) -> Traversal {
        let sb = read_superblock(img).unwrap();
        let groups = read_group_descriptors(img, &sb).unwrap();
        walk(img, &sb, &groups, options)
    }

    #[test]
    fn minimal_tree_yields_exact_path_set() {
        let mut b = ImageBuilder::new(1024);
        b.add_file(ROOT_INO, "hello.txt", b"hola mundo\n");
        b.add_dir(ROOT_INO, "sub");
        let t = run(&b.build(), TraversalOptions::default());

        let mut paths = t.paths();
        paths.sort();
        assert_eq!(paths, vec!["/hello.txt", "/sub"]);
        assert!(t.diagnostics.is_empty());
    }

    #[test]
    fn depth_first_pre_order() {
        let mut b = ImageBuilder::new(1024);
        let a = b.add_dir(ROOT_INO, "a");
        b.add_file(a, "a1", b"1");
        let aa = b.add_dir(a, "aa");
        b.add_file(aa, "deep", b"2");
        b.add_file(ROOT_INO, "z", b"3");
        let t = run(&b.build(), TraversalOptions::default());

        assert_eq!(t.paths(), vec!["/a", "/a/a1", "/a/aa", "/a/aa/deep", "/z"]);
        assert_eq!(t.visits[3].depth, 3);
    }

    #[test]
    fn dot_entries_reported_on_request_but_never_followed() {
        let mut b = ImageBuilder::new(1024);
        b.add_dir(ROOT_INO, "sub");
        let t = run(
            &b.build(),
            TraversalOptions {
                include_dot_entries: true,
                ..Default::default()
            },
        );
        assert_eq!(
            t.paths(),
            vec!["/.", "/..", "/sub", "/sub/.", "/sub/.."]
        );
    }

    #[test]
    fn multi_block_directories_scan_in_pointer_order() {
        let mut b = ImageBuilder::new(1024);
        let names: Vec<String> = (0..12).map(|i| format!("{i:02}-{}", "x".repeat(200))).collect();
        for n in &names {
            b.add_file(ROOT_INO, n, b"");
        }
        let img = b.build();
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let root = crate::inode::resolve_inode(&img, &sb, &groups, ROOT_INO).unwrap();
        assert!(root.direct_blocks().count() > 1);

        let t = walk(&img, &sb, &groups, TraversalOptions::default());
        let got: Vec<String> = t.visits.iter().map(|v| v.entry.name_str()).collect();
        assert_eq!(got, names);
    }

    #[test]
    fn corrupt_block_does_not_hide_later_blocks() {
        let mut b = ImageBuilder::new(1024);
        let names: Vec<String> = (0..12).map(|i| format!("{i:02}-{}", "x".repeat(200))).collect();
        for n in &names {
            b.add_file(ROOT_INO, n, b"");
        }
        let mut img = b.build();
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let root = crate::inode::resolve_inode(&img, &sb, &groups, ROOT_INO).unwrap();
        let first = root.block[0];
        assert!(root.direct_blocks().count() >= 3);

        // rec_len = 0 en la primera entrada del primer bloque
        let off = crate::layout::block_offset(1024, first) as usize;
        img[off + 4..off + 6].copy_from_slice(&0u16.to_le_bytes());

        let t = run(&img, TraversalOptions::default());
        assert_eq!(t.diagnostics.len(), 1);
        assert_eq!(t.diagnostics[0].block, Some(first));
        let got: Vec<String> = t.visits.iter().map(|v| v.entry.name_str()).collect();
        assert_eq!(got, names[4..]);
    }

    #[test]
    fn non_directory_start_is_a_diagnostic() {
        let mut b = ImageBuilder::new(1024);
        let f = b.add_file(ROOT_INO, "f", b"x");
        let img = b.build();
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();

        let events: Vec<_> =
            Traverser::from_inode(&img, &sb, &groups, f, "/f", TraversalOptions::default())
                .collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TraversalEvent::Diagnostic(Diagnostic {
                kind: DiagnosticKind::Decode(DecodeError::NotADirectory { .. }),
                ..
            })
        ));
    }

    #[test]
    fn mistagged_file_is_not_a_directory_and_siblings_continue() {
        let mut b = ImageBuilder::new(1024);
        let f = b.add_file(ROOT_INO, "f", b"x");
        b.add_entry(ROOT_INO, "falso", f, EXT2_FT_DIR);
        b.add_file(ROOT_INO, "g", b"y");
        let t = run(&b.build(), TraversalOptions::default());

        assert_eq!(t.paths(), vec!["/f", "/falso", "/g"]);
        assert_eq!(t.diagnostics.len(), 1);
        assert_eq!(t.diagnostics[0].path, "/falso");
    }

    #[test]
    fn cycles_are_cut_only_when_asked() {
        let mut b = ImageBuilder::new(1024);
        let sub = b.add_dir(ROOT_INO, "sub");
        b.add_entry(sub, "loop", ROOT_INO, EXT2_FT_DIR);
        let img = b.build();

        let guarded = run(
            &img,
            TraversalOptions {
                detect_cycles: true,
                ..Default::default()
            },
        );
        assert_eq!(guarded.paths(), vec!["/sub", "/sub/loop"]);
        assert!(matches!(
            guarded.diagnostics[0].kind,
            DiagnosticKind::CycleSkipped
        ));

        // Sin guarda el recorrido no termina; se toma un prefijo.
        let sb = read_superblock(&img).unwrap();
        let groups = read_group_descriptors(&img, &sb).unwrap();
        let unguarded: Vec<_> =
            Traverser::new(&img, &sb, &groups, TraversalOptions::default())
                .take(50)
                .collect();
        assert_eq!(unguarded.len(), 50);
    }

    #[test]
    fn depth_limit_stops_descent() {
        let mut b = ImageBuilder::new(1024);
        let a = b.add_dir(ROOT_INO, "a");
        let aa = b.add_dir(a, "aa");
        b.add_file(aa, "f", b"");
        let t = run(
            &b.build(),
            TraversalOptions {
                max_depth: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(t.paths(), vec!["/a", "/a/aa"]);
        assert!(matches!(t.diagnostics[0].kind, DiagnosticKind::DepthLimit(1)));
    }

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }
}
