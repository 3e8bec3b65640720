/// Rounds a size up to the heap's double-word alignment, or to an explicit
/// power-of-two boundary.
///
/// # Examples
///
/// ```rust
/// use nextfit::align;
///
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(16), 16);
/// assert_eq!(align!(5, 4), 8);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align!($value, $crate::block::DSIZE)
  };
  ($value:expr, $to:expr) => {
    ($value + $to - 1) & !($to - 1)
  };
}
