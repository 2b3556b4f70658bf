use rivulet::{AttrMap, Buffer, Context, DType, Dispatcher, DeviceKind, Distribution, Placement, TensorDesc};

/// One data-parallel forward/backward step: the batch is split across two ranks, the weights
/// are replicated, and the weight gradient comes back replicated via an all-reduce inserted by
/// boxing.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let context = Context::new();
    let mut dispatcher = Dispatcher::new(&context);
    let placement = Placement::linear(DeviceKind::Cpu, vec![0, 1])?;

    // Batch of four examples with two features, split along the batch axis.
    let batch = dispatcher.feed_global(
        TensorDesc::new(vec![4, 2], DType::F32),
        placement.clone(),
        Distribution::split(0),
        Buffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
        false,
    )?;
    // A 2x2 weight matrix, replicated on every rank.
    let weights = dispatcher.feed_global(
        TensorDesc::new(vec![2, 2], DType::F32),
        placement,
        Distribution::broadcast(1),
        Buffer::F32(vec![0.5, -0.5, 1.0, 1.0]),
        true,
    )?;

    let logits = dispatcher.dispatch("matmul", &[&batch, &weights], AttrMap::new())?.remove(0);
    let activated = dispatcher.dispatch("relu", &[&logits], AttrMap::new())?.remove(0);
    let loss = dispatcher.dispatch("reduce_sum", &[&activated], AttrMap::new())?.remove(0);

    println!("loss distribution: {}", loss.distribution());
    println!("loss = {:?}", dispatcher.fetch_global(&loss)?);

    let gradients = dispatcher.backward(&loss)?;
    let weight_grad = gradients.get(&weights).expect("weights receive a gradient").clone();
    println!("weight gradient distribution: {}", weight_grad.distribution());
    println!("weight gradient = {:?}", dispatcher.fetch_global(&weight_grad)?);
    Ok(())
}
