//! Runtime configuration parameters for a [`PriorityQueue`](crate::PriorityQueue).

const DEFAULT_MAX_RETRIES: u32 = 8;
const DEFAULT_BAG_WIDTH: usize = 8;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    max_retries: u32,
    bag_width: usize,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// This function panics if `bag_width` is 0.
    #[inline]
    pub fn with_params(max_retries: u32, bag_width: usize) -> Self {
        assert!(bag_width > 0, "bag width must be greater than 0");
        Self { max_retries, bag_width }
    }

    /// Returns the default retry budget used by `try_remove_any` when the
    /// caller does not supply one explicitly.
    #[inline]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the number of slots in each bag.
    #[inline]
    pub fn bag_width(&self) -> usize {
        self.bag_width
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
///
/// This is mainly useful for keeping stability, in case the internal
/// structure of the [`Config`] type changes in the future, e.g. because
/// further parameters are added.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    max_retries: Option<u32>,
    bag_width: Option<usize>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry budget passed to `try_remove_any`.
    #[inline]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the number of slots in each bag.
    #[inline]
    pub fn bag_width(mut self, bag_width: usize) -> Self {
        self.bag_width = Some(bag_width);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            self.bag_width.unwrap_or(DEFAULT_BAG_WIDTH),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(config.bag_width(), DEFAULT_BAG_WIDTH);
    }

    #[test]
    fn builder_overrides() {
        let config = ConfigBuilder::new().max_retries(3).bag_width(16).build();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.bag_width(), 16);
    }

    #[test]
    #[should_panic(expected = "bag width must be greater than 0")]
    fn zero_width_panics() {
        Config::with_params(1, 0);
    }
}
