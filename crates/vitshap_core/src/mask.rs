//! Validated player masks.

use burn::prelude::*;

use crate::error::{CoreError, Result};

/// A `(batch, num_players)` mask, one value per player per image.
///
/// Values of 1.0 keep a player, 0.0 remove it; real values in between are
/// allowed and interpreted by the mask location.
///
/// # Example
///
/// ```rust,ignore
/// use vitshap_core::PlayerMask;
///
/// let mask = PlayerMask::<NdArray>::ones(2, 196, &device);
/// let mask = mask.without_player(17);
/// assert_eq!(mask.num_players(), 196);
/// ```
#[derive(Debug, Clone)]
pub struct PlayerMask<B: Backend> {
    inner: Tensor<B, 2>,
}

impl<B: Backend> PlayerMask<B> {
    /// Wrap a tensor, checking that its width equals `num_players`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] when the mask width differs.
    pub fn new(tensor: Tensor<B, 2>, num_players: usize) -> Result<Self> {
        let [_, width] = tensor.dims();
        if width != num_players {
            return Err(CoreError::ShapeMismatch(format!(
                "mask has {} players, expected {}",
                width, num_players
            )));
        }
        Ok(Self { inner: tensor })
    }

    /// An all-ones mask (every player present).
    pub fn ones(batch: usize, num_players: usize, device: &B::Device) -> Self {
        Self {
            inner: Tensor::ones([batch, num_players], device),
        }
    }

    /// Build a mask from per-image rows of player values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if any row length differs from `num_players`.
    pub fn from_rows(rows: &[Vec<f32>], num_players: usize, device: &B::Device) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| r.len() != num_players) {
            return Err(CoreError::ShapeMismatch(format!(
                "mask row has {} players, expected {}",
                bad.len(),
                num_players
            )));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let data = TensorData::new(flat, [rows.len(), num_players]);
        Ok(Self {
            inner: Tensor::from_data(data.convert::<B::FloatElem>(), device),
        })
    }

    /// Remove `player` from every image in the batch.
    #[must_use]
    pub fn without_player(self, player: usize) -> Self {
        let [batch, num_players] = self.inner.dims();
        let device = self.inner.device();
        let mut keep = vec![1.0f32; num_players];
        if let Some(slot) = keep.get_mut(player) {
            *slot = 0.0;
        }
        let keep = Tensor::<B, 1>::from_floats(keep.as_slice(), &device)
            .reshape([1, num_players])
            .repeat_dim(0, batch);
        Self {
            inner: self.inner * keep,
        }
    }

    /// Check that the mask has one row per image.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] when batch sizes differ.
    pub fn check_batch(&self, batch: usize) -> Result<()> {
        if self.batch() != batch {
            return Err(CoreError::ShapeMismatch(format!(
                "mask batch {} != image batch {}",
                self.batch(),
                batch
            )));
        }
        Ok(())
    }

    /// Batch size.
    pub fn batch(&self) -> usize {
        self.inner.dims()[0]
    }

    /// Number of players per image.
    pub fn num_players(&self) -> usize {
        self.inner.dims()[1]
    }

    /// Get the underlying tensor.
    #[must_use]
    pub const fn inner(&self) -> &Tensor<B, 2> {
        &self.inner
    }

    /// Consume self and return the underlying tensor.
    #[must_use]
    pub fn into_inner(self) -> Tensor<B, 2> {
        self.inner
    }

    /// Move the mask to a device.
    #[must_use]
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            inner: self.inner.to_device(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_new_rejects_wrong_width() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::ones([2, 195], &device);
        match PlayerMask::new(tensor, 196) {
            Err(CoreError::ShapeMismatch(_)) => (),
            other => panic!("Expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_without_player() {
        let device = Default::default();
        let mask = PlayerMask::<TestBackend>::ones(2, 4, &device).without_player(2);
        let values: Vec<f32> = mask.into_inner().into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_from_rows() {
        let device = Default::default();
        let rows = vec![vec![1.0, 0.0, 1.0], vec![0.5, 0.5, 0.5]];
        let mask = PlayerMask::<TestBackend>::from_rows(&rows, 3, &device).unwrap();
        assert_eq!(mask.batch(), 2);
        assert_eq!(mask.num_players(), 3);
        assert!(mask.check_batch(2).is_ok());
        assert!(mask.check_batch(3).is_err());

        let bad = vec![vec![1.0, 0.0]];
        assert!(PlayerMask::<TestBackend>::from_rows(&bad, 3, &device).is_err());
    }
}
