#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate finds, for every row of a labeled matrix, all of the minimal "keys" that identify
//! that row: combinations of (column, value) pairs which the row holds and no other row does.
//!
//! A key is minimal when dropping any one of its columns would make it match some other row too.
//! A row can have several minimal keys of different sizes, and a row that is an exact duplicate
//! of another row has none.
//!
//! ```
//! use matrix_row_keys::{compute_minimal_keys, RowKey};
//!
//! let keys = compute_minimal_keys(
//!     vec!["x1".to_string(), "x2".to_string()],
//!     vec!["y1".to_string(), "y2".to_string()],
//!     vec![vec![1, 2], vec![1, 3]],
//! )
//! .unwrap();
//!
//! let y1: Vec<&RowKey<i32>> = keys["y1"].iter().collect();
//! assert_eq!(y1, [&RowKey::new(vec![("x2".to_string(), 2)])]);
//! assert_eq!(y1[0].to_string(), "{x2=2}");
//! ```
//!
//! The search works in three stages. [`ValueIndex`] maps every value in every column to the set
//! of rows holding it. [`ValueIndex::row_keys`] then intersects those row sets for growing
//! combinations of columns, pruning any column that doesn't narrow the candidates down. Every
//! key it accepts passes through a [`KeySet`], which only keeps keys that have no smaller key
//! inside them.

pub use sorted_iter;

use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByItemExt;
use sorted_iter::sorted_iterator::SortedByItem;
use sorted_iter::SortedIterator;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::iter;
use thiserror::Error;
use tracing::{debug, trace};

/// Types which can be used in an [`IdSet`].
pub trait Id: Sized + Copy + Hash + Ord {
    /// SmallVec contains two `usize` fields which overlap with the inline vector, so id sets will
    /// have minimum size if this array occupies the same number of bytes.
    ///
    /// It can be declared like this for any implementation, or you can have the [`id_type!`]
    /// macro do it for you.
    ///
    /// ```ignore
    /// use std::mem::size_of;
    /// type SmallArray = [Self; 2 * size_of::<usize>() / size_of::<Self>()];
    /// ```
    type SmallArray: smallvec::Array<Item = Self> + Clone + std::fmt::Debug + Hash + Ord;
}

/// Generates implementations of the [`Id`] trait which set the associated `SmallArray` type to
/// the biggest array that will fit within a [`SmallVec`][smallvec::SmallVec]'s minimum size.
///
/// It also generates a test with the given `$testname` that checks that the generated definition
/// is as small as the smallest `SmallVec`.
///
/// This crate only addresses rows and columns by `usize`:
///
/// ```ignore
/// id_type![index_id_size, usize];
/// ```
#[macro_export]
macro_rules! id_type {
    ($testname:ident, $($t:ty),*) => {
        $(
            impl $crate::Id for $t {
                type SmallArray = [
                    Self;
                    2 * ::std::mem::size_of::<usize>() / ::std::mem::size_of::<Self>()
                ];
            }
        )*

        #[cfg(test)]
        #[test]
        fn $testname() {
            use $crate::IdSet;
            use smallvec::SmallVec;
            use std::mem::size_of;
            $(
                assert_eq!(
                    size_of::<IdSet<$t>>(),
                    size_of::<SmallVec<[(); 0]>>()
                );
            )*
        }
    };
}

id_type![index_id_size, usize];

/// A sorted set of row or column indices.
///
/// This implementation avoids heap allocations for sets containing a number of ids smaller than
/// the length of [`Id::SmallArray`].
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IdSet<I: Id>(SmallVec<I::SmallArray>);

/// A set of column indices. Together with a row's values at those columns, this is a candidate
/// key for the row.
pub type ColumnSet = IdSet<usize>;

/// A set of row indices, such as every row holding one particular value in some column.
pub type RowSet = IdSet<usize>;

impl<I: Id> IdSet<I> {
    /// Creates a set containing the specified ids.
    ///
    /// It's okay if the provided slice contains duplicates.
    pub fn new(ids: &[I]) -> Self {
        let mut v = SmallVec::from_slice(ids);
        v.sort_unstable();
        v.dedup();
        IdSet(v)
    }

    /// The number of ids in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no ids.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the ids in this set, in ascending order.
    ///
    /// ```
    /// use matrix_row_keys::IdSet;
    ///
    /// let abc = IdSet::<usize>::new(&[2, 3, 1]);
    /// let mut it = abc.iter();
    /// assert_eq!(it.next(), Some(1));
    /// assert_eq!(it.next(), Some(2));
    /// assert_eq!(it.next(), Some(3));
    /// assert_eq!(it.next(), None);
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = I> + SortedByItem + Clone + '_ {
        self.0.iter().copied().assume_sorted_by_item()
    }

    /// Returns `true` if `id` is in this set.
    pub fn contains(&self, id: I) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Returns `true` if `other` contains every id that `self` does.
    ///
    /// ```
    /// use matrix_row_keys::IdSet;
    /// let nil = IdSet::<usize>::new(&[]);
    /// let one = IdSet::new(&[1]);
    ///
    /// assert!(nil.is_subset(&one));
    /// assert!(nil.is_subset(&nil));
    /// assert!(one.is_subset(&one));
    /// assert!(!one.is_subset(&nil));
    /// ```
    pub fn is_subset(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.iter().intersection(other.iter()).eq(self.iter())
    }

    /// Returns `true` if `self` contains every id that `other` does.
    pub fn is_superset(&self, other: &Self) -> bool {
        other.is_subset(self)
    }

    /// Returns the ids found in both `self` and `other`.
    ///
    /// ```
    /// use matrix_row_keys::IdSet;
    ///
    /// let a = IdSet::<usize>::new(&[1, 2, 4]);
    /// let b = IdSet::new(&[2, 3, 4]);
    /// assert_eq!(a.intersection(&b), IdSet::new(&[2, 4]));
    /// ```
    pub fn intersection(&self, other: &Self) -> Self {
        IdSet(self.iter().intersection(other.iter()).collect())
    }

    /// Returns a copy of this set with `id` added.
    fn with(&self, id: I) -> Self {
        IdSet(
            self.iter()
                .union(iter::once(id).assume_sorted_by_item())
                .collect(),
        )
    }

    /// Returns the ids which come after the one at `position` in iteration order.
    fn after(&self, position: usize) -> Self {
        IdSet(SmallVec::from_slice(&self.0[position + 1..]))
    }
}

impl<I: Id + std::fmt::Debug> std::fmt::Debug for IdSet<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl<I: Id> iter::FromIterator<I> for IdSet<I> {
    /// Creates a set containing the specified ids.
    ///
    /// It's okay if the provided iterator contains duplicates.
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut v = SmallVec::from_iter(iter);
        v.sort_unstable();
        v.dedup();
        IdSet(v)
    }
}

/// Types which can be stored in the cells of a [`Matrix`].
///
/// Values are only ever compared for equality; the ordering is used to give keys a canonical
/// order.
#[cfg(not(feature = "parallel"))]
pub trait Value: Clone + Eq + Hash + Ord {}

#[cfg(not(feature = "parallel"))]
impl<T: Clone + Eq + Hash + Ord> Value for T {}

/// Types which can be stored in the cells of a [`Matrix`].
///
/// Values are only ever compared for equality; the ordering is used to give keys a canonical
/// order. Rows are searched on several threads, so values must be shareable between them.
#[cfg(feature = "parallel")]
pub trait Value: Clone + Eq + Hash + Ord + Send + Sync {}

#[cfg(feature = "parallel")]
impl<T: Clone + Eq + Hash + Ord + Send + Sync> Value for T {}

/// Reasons a [`Matrix`] can't be built from the given names and rows.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MatrixError {
    /// There must be exactly one row name per row.
    #[error("matrix has {rows} rows but {row_names} row names")]
    RowCountMismatch {
        /// Number of row names supplied.
        row_names: usize,
        /// Number of rows supplied.
        rows: usize,
    },

    /// Every row must have one value per column.
    #[error("row {row:?} has {found} values but there are {expected} columns")]
    RowLength {
        /// Name of the offending row.
        row: String,
        /// Number of values in that row.
        found: usize,
        /// Number of columns in the matrix.
        expected: usize,
    },

    /// Row names must be unique.
    #[error("row name {0:?} appears more than once")]
    DuplicateRowName(String),
}

/// A table of values with named rows and columns.
///
/// The shape is checked once in [`Matrix::new`] and the matrix can't be modified afterward, so
/// everything else in this crate can rely on every row having one value per column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Matrix<T> {
    column_names: Vec<String>,
    row_names: Vec<String>,
    rows: Vec<Vec<T>>,
}

impl<T> Matrix<T> {
    /// Creates a matrix from its column names, row names, and rows of values.
    ///
    /// ```
    /// use matrix_row_keys::{Matrix, MatrixError};
    ///
    /// let columns = vec!["x1".to_string(), "x2".to_string()];
    /// let short = Matrix::new(columns, vec!["y1".to_string()], vec![vec![1]]);
    /// assert_eq!(
    ///     short,
    ///     Err(MatrixError::RowLength { row: "y1".to_string(), found: 1, expected: 2 })
    /// );
    /// ```
    pub fn new(
        column_names: Vec<String>,
        row_names: Vec<String>,
        rows: Vec<Vec<T>>,
    ) -> Result<Self, MatrixError> {
        if row_names.len() != rows.len() {
            return Err(MatrixError::RowCountMismatch {
                row_names: row_names.len(),
                rows: rows.len(),
            });
        }

        let mut seen = HashSet::with_capacity(row_names.len());
        for (name, row) in row_names.iter().zip(rows.iter()) {
            if row.len() != column_names.len() {
                return Err(MatrixError::RowLength {
                    row: name.clone(),
                    found: row.len(),
                    expected: column_names.len(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(MatrixError::DuplicateRowName(name.clone()));
            }
        }

        Ok(Matrix {
            column_names,
            row_names,
            rows,
        })
    }

    /// The names of the columns, in order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// The names of the rows, in order.
    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    /// The values of every row, each in column order.
    pub fn rows(&self) -> &[Vec<T>] {
        &self.rows
    }

    /// Returns `true` if the matrix has no rows or no columns, in which case no row has any key.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.column_names.is_empty()
    }
}

impl<T: Value> Matrix<T> {
    /// Computes every minimal key for every row of this matrix.
    ///
    /// Rows which are exact duplicates of another row are present in the result, with no keys.
    /// If the matrix has no rows or no columns, the result is empty.
    pub fn minimal_keys(&self) -> MinimalKeys<T> {
        if self.is_empty() {
            debug!(
                columns = self.column_names.len(),
                rows = self.rows.len(),
                "matrix is empty; no keys to find"
            );
            return MinimalKeys::new();
        }

        let index = ValueIndex::new(self);
        let materialize = |row: usize| {
            let keys = index.row_keys(row);
            let values = &self.rows[row];
            let keys = keys
                .iter()
                .map(|key| {
                    key.iter()
                        .map(|column| (self.column_names[column].clone(), values[column].clone()))
                        .collect::<RowKey<T>>()
                })
                .collect::<BTreeSet<_>>();
            (self.row_names[row].clone(), keys)
        };

        #[cfg(feature = "parallel")]
        let result = {
            use rayon::prelude::*;
            (0..self.rows.len()).into_par_iter().map(materialize).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let result = (0..self.rows.len()).map(materialize).collect();

        result
    }
}

/// Computes every minimal key for every row of the matrix made of these names and rows.
///
/// This is [`Matrix::new`] followed by [`Matrix::minimal_keys`]. A malformed matrix is rejected
/// before any searching starts.
///
/// ```
/// use matrix_row_keys::{compute_minimal_keys, RowKey};
///
/// let names = |prefix: &str, n: usize| -> Vec<String> {
///     (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
/// };
/// let keys = compute_minimal_keys(
///     names("x", 3),
///     names("y", 3),
///     vec![vec![1, 1, 1], vec![2, 1, 2], vec![3, 3, 1]],
/// )
/// .unwrap();
///
/// let key = |pairs: &[(&str, i32)]| {
///     pairs.iter().map(|&(c, v)| (c.to_string(), v)).collect::<RowKey<i32>>()
/// };
/// let y1: Vec<&RowKey<i32>> = keys["y1"].iter().collect();
/// assert_eq!(y1, [&key(&[("x1", 1)]), &key(&[("x2", 1), ("x3", 1)])]);
/// ```
pub fn compute_minimal_keys<T: Value>(
    column_names: Vec<String>,
    row_names: Vec<String>,
    rows: Vec<Vec<T>>,
) -> Result<MinimalKeys<T>, MatrixError> {
    Ok(Matrix::new(column_names, row_names, rows)?.minimal_keys())
}

/// An inverted index over a [`Matrix`]: for every column, the set of rows holding each value.
///
/// ```
/// use matrix_row_keys::{IdSet, Matrix, ValueIndex};
///
/// let matrix = Matrix::new(
///     vec!["x1".to_string()],
///     vec!["y1".to_string(), "y2".to_string(), "y3".to_string()],
///     vec![vec!["a"], vec!["b"], vec!["a"]],
/// )
/// .unwrap();
/// let index = ValueIndex::new(&matrix);
///
/// assert_eq!(index.rows_with(0, &"a"), Some(&IdSet::new(&[0, 2])));
/// assert_eq!(index.rows_with(0, &"c"), None);
/// ```
#[derive(Debug)]
pub struct ValueIndex<'m, T> {
    matrix: &'m Matrix<T>,
    columns: Vec<HashMap<&'m T, RowSet>>,
}

impl<'m, T: Value> ValueIndex<'m, T> {
    /// Indexes every cell of the matrix.
    pub fn new(matrix: &'m Matrix<T>) -> Self {
        let mut columns: Vec<HashMap<&'m T, RowSet>> =
            iter::repeat_with(HashMap::new).take(matrix.column_names.len()).collect();

        // Rows are visited in ascending order, so pushing onto the end keeps every set sorted.
        for (row, values) in matrix.rows.iter().enumerate() {
            for (column, value) in columns.iter_mut().zip(values.iter()) {
                column
                    .entry(value)
                    .or_insert_with(|| IdSet::new(&[]))
                    .0
                    .push(row);
            }
        }

        for column in columns.iter_mut() {
            column.shrink_to_fit();
        }

        debug!(
            columns = columns.len(),
            rows = matrix.rows.len(),
            distinct_values = columns.iter().map(HashMap::len).sum::<usize>(),
            "indexed matrix"
        );

        ValueIndex { matrix, columns }
    }

    /// The number of columns in the indexed matrix.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Returns the rows holding `value` in the given column, or `None` if no row does.
    ///
    /// # Panics
    ///
    /// This method panics if `column` is out of range.
    pub fn rows_with(&self, column: usize, value: &T) -> Option<&RowSet> {
        self.columns[column].get(value)
    }

    /// Returns, for each column, the set of rows sharing `row`'s value in that column. Every set
    /// includes `row` itself.
    ///
    /// # Panics
    ///
    /// This method panics if `row` is out of range.
    pub fn postings(&self, row: usize) -> Vec<&RowSet> {
        self.matrix.rows[row]
            .iter()
            .zip(self.columns.iter())
            .map(|(value, column)| &column[value])
            .collect()
    }

    /// Finds every minimal key for the given row, as sets of column indices.
    ///
    /// The search starts once from every column. From a partial key, it tries adding each
    /// remaining column in ascending order, and only follows a column if intersecting its row set
    /// shrinks the candidate rows while also leaving out some row that shares the new column's
    /// value. Once a column has been tried, later siblings don't consider it again, so no
    /// combination is reached twice from the same starting point.
    ///
    /// A partial key is accepted as soon as it matches only `row`. Accepted keys are merged into
    /// a [`KeySet`], which drops any that aren't minimal.
    ///
    /// ```
    /// use matrix_row_keys::{IdSet, Matrix, ValueIndex};
    ///
    /// let matrix = Matrix::new(
    ///     vec!["x1".to_string(), "x2".to_string(), "x3".to_string()],
    ///     vec!["y1".to_string(), "y2".to_string(), "y3".to_string()],
    ///     vec![vec![1, 1, 1], vec![2, 1, 2], vec![3, 3, 1]],
    /// )
    /// .unwrap();
    /// let index = ValueIndex::new(&matrix);
    ///
    /// let keys: Vec<_> = index.row_keys(0).iter().cloned().collect();
    /// assert_eq!(keys, [IdSet::new(&[0]), IdSet::new(&[1, 2])]);
    /// ```
    ///
    /// # Panics
    ///
    /// This method panics if `row` is out of range.
    pub fn row_keys(&self, row: usize) -> KeySet {
        struct Frame {
            key: ColumnSet,
            remaining: ColumnSet,
            rows: RowSet,
        }

        let postings = self.postings(row);
        let columns = postings.len();
        let mut keys = KeySet::new();

        let mut stack: Vec<Frame> = (0..columns)
            .rev()
            .map(|start| Frame {
                key: IdSet::new(&[start]),
                remaining: (0..columns).filter(|&column| column != start).collect(),
                rows: postings[start].clone(),
            })
            .collect();

        while let Some(frame) = stack.pop() {
            match frame.rows.len() {
                0 => continue,
                1 => {
                    debug_assert!(frame.rows.contains(row));
                    trace!(row, key = ?frame.key, "found key");
                    keys.insert(frame.key);
                    continue;
                }
                _ => {}
            }

            for (position, column) in frame.remaining.iter().enumerate() {
                let sharing = postings[column];
                let narrowed = frame.rows.intersection(sharing);
                if narrowed.len() < frame.rows.len().min(sharing.len()) {
                    stack.push(Frame {
                        key: frame.key.with(column),
                        remaining: frame.remaining.after(position),
                        rows: narrowed,
                    });
                }
            }
        }

        debug!(
            row = %self.matrix.row_names[row],
            keys = keys.len(),
            "searched row"
        );
        keys
    }
}

/// A set of keys for one row, where no key is a subset of any other.
///
/// Keys are kept sorted by size and then by their natural order, so two key sets holding the
/// same keys compare equal regardless of the order the keys were found in.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeySet {
    keys: Vec<ColumnSet>,
}

impl KeySet {
    /// Creates a new empty key set.
    pub fn new() -> Self {
        KeySet { keys: Vec::new() }
    }

    /// The number of keys in the set.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns `true` if exactly this key is in the set.
    pub fn contains(&self, key: &ColumnSet) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Returns an iterator over the keys, smallest first.
    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = &ColumnSet> + ExactSizeIterator + iter::FusedIterator + '_
    {
        self.keys.iter()
    }

    fn sort_by(a: &ColumnSet, b: &ColumnSet) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }

    /// Adds a key to this set if no key already in the set is a subset of it, and removes keys
    /// which are supersets of this one. Returns `true` if the key was added.
    ///
    /// Empty keys are never added.
    ///
    /// ```
    /// use matrix_row_keys::{IdSet, KeySet};
    ///
    /// let ab = IdSet::new(&[1, 2]);
    /// let a = IdSet::new(&[1]);
    /// let b = IdSet::new(&[2]);
    ///
    /// let mut keys = KeySet::new();
    /// assert!(keys.insert(ab.clone()));
    /// assert!(!keys.insert(ab.clone()));
    /// assert!(keys.insert(a.clone()));
    /// assert!(!keys.contains(&ab));
    /// assert!(!keys.insert(ab.clone()));
    /// assert!(keys.insert(b.clone()));
    ///
    /// let mut other = KeySet::new();
    /// other.insert(b);
    /// other.insert(a);
    /// assert_eq!(keys, other);
    /// ```
    pub fn insert(&mut self, key: ColumnSet) -> bool {
        if key.is_empty() {
            return false;
        }

        // An equal key, or any smaller key inside this one, already identifies the row.
        if self.keys.iter().any(|existing| existing.is_subset(&key)) {
            return false;
        }

        // Anything this key is inside of has a redundant column.
        self.keys.retain(|existing| !key.is_subset(existing));

        let insert_at = self
            .keys
            .binary_search_by(|probe| KeySet::sort_by(probe, &key))
            .unwrap_or_else(|at| at);
        self.keys.insert(insert_at, key);
        true
    }
}

/// A key for one row, as (column name, value) pairs.
///
/// The pairs are kept sorted by column name and then value, so equal keys are equal regardless
/// of the order they were built in.
///
/// ```
/// use matrix_row_keys::RowKey;
///
/// let key = RowKey::new(vec![("x4".to_string(), 4), ("x1".to_string(), 1)]);
/// assert_eq!(key.to_string(), "{x1=1, x4=4}");
/// assert_eq!(key.len(), 2);
/// ```
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RowKey<T>(Vec<(String, T)>);

impl<T: Ord> RowKey<T> {
    /// Creates a key from (column name, value) pairs.
    ///
    /// It's okay if the provided pairs contain duplicates.
    pub fn new(pairs: Vec<(String, T)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl<T> RowKey<T> {
    /// The number of columns in this key.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the key has no columns. Keys produced by this crate never are.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the (column name, value) pairs in this key.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &T)> + '_ {
        self.0.iter().map(|(column, value)| (column.as_str(), value))
    }
}

impl<T: Ord> iter::FromIterator<(String, T)> for RowKey<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut pairs: Vec<(String, T)> = iter.into_iter().collect();
        pairs.sort_unstable();
        pairs.dedup();
        RowKey(pairs)
    }
}

impl<T: std::fmt::Display> std::fmt::Display for RowKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        f.write_str("}")
    }
}

/// Every minimal key of every row, by row name.
pub type MinimalKeys<T> = HashMap<String, BTreeSet<RowKey<T>>>;
