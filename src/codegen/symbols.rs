//! Symbolic 2D vectors for the edge-edge collision stencil.
//!
//! The stencil has four points, lettered `i, j, k, l`. Each point carries a
//! position vector (prefix `V`) and a velocity vector (prefix `U`), and each
//! vector is a pair of scalar symbols spelled with C array syntax
//! (`Vi[0]`, `Vi[1]`, ...) so the emitted code can read them straight off the
//! caller's `double[2]` parameters.

use super::c_ast::Expr;

pub const POINT_LETTERS: [char; 4] = ['i', 'j', 'k', 'l'];

/// A named symbolic 2D vector: two fresh scalar leaves.
#[derive(Debug, Clone, Copy)]
pub struct Vec2Sym {
    pub x: Expr,
    pub y: Expr,
}

impl Vec2Sym {
    fn symbol(prefix: char, letter: char) -> Self {
        let base = format!("{prefix}{letter}");
        Self {
            x: Expr::ident(base.clone()).index(0),
            y: Expr::ident(base).index(1),
        }
    }

    pub fn add(self, rhs: Vec2Sym) -> Vec2Sym {
        Vec2Sym {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }

    pub fn sub(self, rhs: Vec2Sym) -> Vec2Sym {
        Vec2Sym {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }

    pub fn scale(self, factor: Expr) -> Vec2Sym {
        Vec2Sym {
            x: factor * self.x,
            y: factor * self.y,
        }
    }

    pub fn dot(self, rhs: Vec2Sym) -> Expr {
        self.x * rhs.x + self.y * rhs.y
    }

    /// 90-degree rotation: `(x, y) -> (y, -x)`. Length-preserving.
    pub fn rot90(self) -> Vec2Sym {
        Vec2Sym {
            x: self.y,
            y: -self.x,
        }
    }

    /// Euclidean norm, `sqrt(x*x + y*y)`.
    pub fn norm(self) -> Expr {
        self.dot(self).sqrt()
    }
}

/// Build the four stencil vectors `{prefix}i .. {prefix}l`.
///
/// Symbols are created fresh on every call; two calls with distinct prefixes
/// can never alias.
pub fn vec2_symbols(prefix: char) -> [Vec2Sym; 4] {
    POINT_LETTERS.map(|letter| Vec2Sym::symbol(prefix, letter))
}
