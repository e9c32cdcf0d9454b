use crate::{DataType, DevicePtr, GpuMatrix};
use cust::memory::{DeviceBuffer, DeviceCopy};

impl<T: DataType + DeviceCopy> GpuMatrix<T> for DeviceBuffer<T> {
    fn device_ptr(&self) -> DevicePtr {
        DevicePtr::from_raw((**self).as_device_ptr().as_raw())
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}
