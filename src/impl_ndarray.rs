use crate::{BuildError, Builder, Element, TensorView};
use ndarray::{prelude::*, Data, ShapeError};
use std::borrow::Cow;

impl<'a, T: Element> TensorView<'a, T> {
    /// Copies the tensor into an owned array of its shape.
    pub fn to_array(&self) -> Result<ArrayD<T>, ShapeError> {
        ArrayD::from_shape_vec(IxDyn(self.shape()), self.to_vec())
    }

    /// Views the tensor as an array without copying.
    ///
    /// Returns `None` whenever [`TensorView::as_slice`] does.
    pub fn as_array_view(&self) -> Option<ArrayViewD<'a, T>> {
        ArrayViewD::from_shape(IxDyn(self.shape()), self.as_slice()?).ok()
    }
}

impl<'data> Builder<'data> {
    /// Adds an array as a tensor of the same shape.
    ///
    /// Arrays in standard layout are borrowed; other layouts are copied in
    /// logical order.
    pub fn add_array<T, S, D>(
        &mut self,
        name: &str,
        array: &'data ArrayBase<S, D>,
    ) -> Result<&mut Self, BuildError>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let data = match array.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(array.iter().copied().collect()),
        };
        self.add(name, array.shape(), T::into_data(data))
    }
}

#[cfg(test)]
mod tests {
    use crate::{Builder, Container};
    use ndarray::{array, Array3, ShapeBuilder as _};

    #[test]
    fn arrays_round_trip() {
        let matrix = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let transposed = matrix.t();
        let cube = Array3::<i64>::from_shape_vec((2, 1, 2).f(), vec![1, 2, 3, 4]).unwrap();

        let mut builder = Builder::new();
        builder
            .add_array("matrix", &matrix)
            .unwrap()
            .add_array("transposed", &transposed)
            .unwrap()
            .add_array("cube", &cube)
            .unwrap();
        let mut bytes = Vec::new();
        builder.write(&mut bytes).unwrap();
        let container = Container::read(bytes.as_slice()).unwrap();

        let view = container.view::<f32>("matrix").unwrap();
        assert_eq!(view.to_array().unwrap(), matrix.clone().into_dyn());
        assert_eq!(
            container.view::<f32>("transposed").unwrap().to_array().unwrap(),
            transposed.to_owned().into_dyn()
        );
        assert_eq!(container.view::<i64>("cube").unwrap().to_array().unwrap(), cube.into_dyn());
    }

    #[test]
    fn scalar_view() {
        let mut builder = Builder::new();
        builder.add("s", [], &[42u8]).unwrap();
        let container = builder.build();
        let view = container.view::<u8>("s").unwrap();
        let array = view.as_array_view().unwrap();
        assert_eq!(array.ndim(), 0);
        assert_eq!(array.iter().copied().collect::<Vec<_>>(), [42]);
    }
}
