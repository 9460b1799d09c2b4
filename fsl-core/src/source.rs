//! Reads dialect files and splices `#include`d files into one token stream.

use crate::ast::{SourceLoc, Tok};
use crate::bail_syntax_at;
use crate::error::{CompilerError, Result};
use crate::lexer::{self, Token};
use log::{debug, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Token stream of one input file with its includes already spliced in.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub name: String,
    pub tokens: Vec<Tok>,
    /// Every file read, root first, in the order first encountered.
    pub dependencies: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceLoader {
    include_paths: Vec<PathBuf>,
}

struct LoadState {
    tokens: Vec<Tok>,
    dependencies: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
    stack: Vec<PathBuf>,
    /// Include set at the start of the open shader block; restored at `#end`.
    block_seen: Option<HashSet<PathBuf>>,
}

impl SourceLoader {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        SourceLoader { include_paths }
    }

    pub fn load(&self, path: &Path) -> Result<LoadedSource> {
        let canonical = path.canonicalize().map_err(|e| CompilerError::path_io(path, e))?;
        let text = std::fs::read_to_string(&canonical).map_err(|e| CompilerError::path_io(path, e))?;
        let mut state = LoadState {
            tokens: Vec::new(),
            dependencies: vec![canonical.clone()],
            seen: HashSet::from([canonical.clone()]),
            stack: vec![canonical.clone()],
            block_seen: None,
        };
        let name = path.display().to_string();
        self.splice(&name, &text, canonical.parent(), &mut state)?;
        Ok(LoadedSource {
            name,
            tokens: state.tokens,
            dependencies: state.dependencies,
        })
    }

    /// Loads in-memory text. Includes resolve against `base_dir` and the include paths.
    pub fn load_str(&self, name: &str, text: &str, base_dir: Option<&Path>) -> Result<LoadedSource> {
        let mut state = LoadState {
            tokens: Vec::new(),
            dependencies: Vec::new(),
            seen: HashSet::new(),
            stack: Vec::new(),
            block_seen: None,
        };
        self.splice(name, text, base_dir, &mut state)?;
        Ok(LoadedSource {
            name: name.to_string(),
            tokens: state.tokens,
            dependencies: state.dependencies,
        })
    }

    fn splice(&self, name: &str, text: &str, dir: Option<&Path>, state: &mut LoadState) -> Result<()> {
        let file: Arc<str> = Arc::from(name);
        let lexemes = lexer::tokenize(text).map_err(|e| CompilerError::Syntax {
            file: name.to_string(),
            line: e.line,
            message: e.message,
        })?;

        for lexeme in lexemes {
            let loc = SourceLoc::new(file.clone(), lexeme.line);
            if let Token::Directive { name: directive, rest } = &lexeme.token {
                match directive.as_str() {
                    "include" => {
                        self.include(rest, dir, &loc, state)?;
                        continue;
                    }
                    "define" | "undef" => {
                        bail_syntax_at!(loc, "'#{}' is not supported; use feature flags instead", directive)
                    }
                    "pragma" => {
                        if rest != "once" {
                            warn!("{}: ignoring '#pragma {}'", loc, rest);
                        }
                        continue;
                    }
                    // Each shader block is an independent output, so it gets its own includes.
                    "vert" | "frag" | "comp" => state.block_seen = Some(state.seen.clone()),
                    "end" => {
                        if let Some(saved) = state.block_seen.take() {
                            state.seen = saved;
                        }
                    }
                    _ => {}
                }
            }
            state.tokens.push(Tok {
                token: lexeme.token,
                loc,
            });
        }
        Ok(())
    }

    fn include(&self, operand: &str, dir: Option<&Path>, loc: &SourceLoc, state: &mut LoadState) -> Result<()> {
        let target = operand
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| operand.strip_prefix('<').and_then(|s| s.strip_suffix('>')));
        let Some(target) = target else {
            bail_syntax_at!(loc, "malformed #include '{}'", operand);
        };

        let found = dir
            .into_iter()
            .chain(self.include_paths.iter().map(PathBuf::as_path))
            .map(|base| base.join(target))
            .find(|candidate| candidate.is_file());
        let Some(found) = found else {
            bail_syntax_at!(loc, "cannot find include file '{}'", target);
        };
        let canonical = found.canonicalize().map_err(|e| CompilerError::path_io(&found, e))?;

        if state.stack.contains(&canonical) {
            bail_syntax_at!(loc, "include cycle through '{}'", target);
        }
        if !state.seen.insert(canonical.clone()) {
            debug!("{}: '{}' already included", loc, target);
            return Ok(());
        }

        let text = std::fs::read_to_string(&canonical).map_err(|e| CompilerError::path_io(&found, e))?;
        if !state.dependencies.contains(&canonical) {
            state.dependencies.push(canonical.clone());
        }
        state.stack.push(canonical.clone());
        let name = found.display().to_string();
        self.splice(&name, &text, canonical.parent(), state)?;
        state.stack.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_include_is_spliced_with_its_own_locations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("common.h"), "#pragma once\nfloat a;\n").unwrap();
        fs::write(
            dir.path().join("main.fsl"),
            "#include \"common.h\"\n#include \"common.h\"\nfloat b;\n",
        )
        .unwrap();

        let loaded = SourceLoader::default().load(&dir.path().join("main.fsl")).unwrap();
        assert_eq!(loaded.dependencies.len(), 2);
        let idents: Vec<String> = loaded.tokens.iter().map(|t| t.token.to_string()).collect();
        assert_eq!(idents, vec!["float", "a", ";", "float", "b", ";"]);
        assert!(loaded.tokens[1].loc.file.ends_with("common.h"));
        assert_eq!(loaded.tokens[1].loc.line, 2);
        assert_eq!(loaded.tokens[4].loc.line, 3);
    }

    #[test]
    fn test_each_shader_block_gets_its_own_includes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("table.h"), "#pragma once\nint t;\n").unwrap();
        fs::write(
            dir.path().join("main.fsl"),
            "#vert a\n#include \"table.h\"\n#end\n#frag b\n#include \"table.h\"\n#end\n",
        )
        .unwrap();

        let loaded = SourceLoader::default().load(&dir.path().join("main.fsl")).unwrap();
        let count = loaded.tokens.iter().filter(|t| t.token.is_ident("t")).count();
        assert_eq!(count, 2);
        assert_eq!(loaded.dependencies.len(), 2);
    }

    #[test]
    fn test_include_search_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("inc");
        fs::create_dir(&inc).unwrap();
        fs::write(inc.join("lib.h"), "int x;").unwrap();

        let loader = SourceLoader::new(vec![inc]);
        let loaded = loader.load_str("mem.fsl", "#include <lib.h>\n", None).unwrap();
        assert_eq!(loaded.tokens.len(), 3);
    }

    #[test]
    fn test_include_cycle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.h"), "#include \"b.h\"\n").unwrap();
        fs::write(dir.path().join("b.h"), "#include \"a.h\"\n").unwrap();

        let err = SourceLoader::default().load(&dir.path().join("a.h")).unwrap_err();
        assert!(err.to_string().contains("include cycle"), "{}", err);
    }

    #[test]
    fn test_missing_include_and_define() {
        let loader = SourceLoader::default();
        let err = loader.load_str("m.fsl", "\n#include \"nope.h\"", None).unwrap_err();
        assert!(matches!(err, CompilerError::Syntax { line: 2, .. }));

        let err = loader.load_str("m.fsl", "#define X 1", None).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
