use burn::tensor::backend::Backend;
use burn::tensor::{DataError, Tensor};
use thiserror::Error;

/// Entry name under which detectors report slot accuracy (percent).
pub const ACCURACY_KEY: &str = "acc";

/// A named output of a detector in loss mode: one scalar tensor, or a list of
/// them (e.g. one term per feature level).
#[derive(Debug, Clone)]
pub enum LossTerm<B: Backend> {
    Single(Tensor<B, 1>),
    List(Vec<Tensor<B, 1>>),
}

impl<B: Backend> LossTerm<B> {
    pub fn tensors(&self) -> Vec<Tensor<B, 1>> {
        match self {
            LossTerm::Single(t) => vec![t.clone()],
            LossTerm::List(ts) => ts.clone(),
        }
    }

    /// Mean of a single term, or the sum of per-term means for a list.
    /// `None` for an empty list.
    pub fn reduce(&self) -> Option<Tensor<B, 1>> {
        match self {
            LossTerm::Single(t) => Some(t.clone().mean()),
            LossTerm::List(ts) => ts
                .iter()
                .map(|t| t.clone().mean())
                .reduce(|acc, t| acc + t),
        }
    }
}

/// Insertion-ordered mapping from output name to loss term.
#[derive(Debug, Clone)]
pub struct LossOutputs<B: Backend> {
    entries: Vec<(String, LossTerm<B>)>,
}

impl<B: Backend> Default for LossOutputs<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<B: Backend> LossOutputs<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, term: LossTerm<B>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = term,
            None => self.entries.push((name, term)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, term: LossTerm<B>) -> Self {
        self.insert(name, term);
        self
    }

    pub fn get(&self, name: &str) -> Option<&LossTerm<B>> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, term)| term)
    }

    pub fn remove(&mut self, name: &str) -> Option<LossTerm<B>> {
        let idx = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LossTerm<B>)> {
        self.entries.iter().map(|(key, term)| (key.as_str(), term))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scalar value of the `acc` entry; `Ok(None)` when there is none.
    pub fn accuracy(&self) -> Result<Option<f32>, ReadbackError> {
        let Some(term) = self.get(ACCURACY_KEY) else {
            return Ok(None);
        };
        let values = term
            .tensors()
            .into_iter()
            .map(scalar_f32)
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f32>() / values.len() as f32))
    }

    /// Sum of every term of every entry except `acc`.
    ///
    /// Backpropagating this sum yields the same input gradient as
    /// backpropagating each term on its own and letting the gradients
    /// accumulate.
    pub fn objective(&self) -> Option<Tensor<B, 1>> {
        self.entries
            .iter()
            .filter(|(key, _)| key != ACCURACY_KEY)
            .flat_map(|(_, term)| term.tensors())
            .map(|t| t.sum())
            .reduce(|acc, t| acc + t)
    }
}

#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("failed to read tensor data: {0:?}")]
    Data(DataError),
    #[error("tensor has no elements")]
    Empty,
}

/// First element of a tensor as `f32`.
pub fn scalar_f32<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<f32, ReadbackError> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(ReadbackError::Data)?
        .first()
        .copied()
        .ok_or(ReadbackError::Empty)
}
