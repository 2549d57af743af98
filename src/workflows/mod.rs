//! Reusable pipeline shapes built on [`ArlExecute`].
//!
//! These functions only assemble calls; whether the work happens right away
//! or when the returned values are computed is up to the context's mode.

mod image;

use anyhow::ensure;

pub use crate::workflows::image::{
    FacetIndex, Image, RasterIter, TestImage, Window, assemble_facets, create_test_image,
    extract_facet, image_raster_iter,
};
use crate::{ArlExecute, Value};

/// Applies `stage` to each of the `facets × facets` facets of `image` and
/// stitches the results back together.
///
/// The image may still be pending: facets are cut out by tasks of their own,
/// so the whole workflow can be assembled before the image exists.
pub fn generic_image_workflow<F>(
    arl: &ArlExecute,
    stage: F,
    image: Value<Image>,
    facets: usize,
) -> anyhow::Result<Value<Image>>
where
    F: Fn(&Image) -> anyhow::Result<Image> + Send + Sync + 'static,
{
    ensure!(facets > 0, "number of facets must be positive");

    let extract = arl.execute(extract_facet);
    let stage = arl.execute(stage);

    let mut parts = Vec::with_capacity(facets * facets);
    for index in 0..facets * facets {
        let facet = extract.call((image.clone(), Value::new(FacetIndex { facets, index })))?;
        parts.push(stage.call::<fn(Image) -> Image>((facet,))?);
    }

    let parts = arl.gather(parts)?;
    Ok(arl.execute(assemble_facets).call((image, parts))?)
}

/// Applies `stage` to every window produced by `iterator` over a concrete
/// `image` and stitches the results back together.
pub fn generic_image_iterator_workflow<F, I>(
    arl: &ArlExecute,
    stage: F,
    image: &Image,
    iterator: I,
    facets: usize,
) -> anyhow::Result<Value<Image>>
where
    F: Fn(&Image) -> anyhow::Result<Image> + Send + Sync + 'static,
    I: Fn(&Image, usize) -> anyhow::Result<RasterIter>,
{
    let stage = arl.execute(stage);

    let parts = iterator(image, facets)?
        .map(|window| {
            let patch = arl.scatter(image.facet(&window))?;
            stage.call::<fn(Image) -> Image>((patch,))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let model = arl.scatter(image.clone())?;
    let parts = arl.gather(parts)?;
    Ok(arl.execute(assemble_facets).call((model, parts))?)
}

/// Applies `stage` to every item of `items`, passing the same `params` to
/// each call.
pub fn generic_list_workflow<F, T, P, R>(
    arl: &ArlExecute,
    stage: F,
    items: &[Value<T>],
    params: Value<P>,
) -> anyhow::Result<Vec<Value<R>>>
where
    F: Fn(&T, &P) -> anyhow::Result<R> + Send + Sync + 'static,
    T: Send + Sync + 'static,
    P: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    let stage = arl.execute(stage);

    let values = items
        .iter()
        .map(|item| stage.call::<fn(T, P) -> R>((item.clone(), params.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn imagerooter(image: &Image) -> anyhow::Result<Image> {
        let mut image = image.clone();
        image.data.mapv_inplace(|x| x.abs().sqrt());
        Ok(image)
    }

    fn assert_rooted(root: &Image, model: &Image) {
        assert_eq!(root.npixel(), model.npixel());
        for (r, m) in root.data.iter().zip(model.data.iter()) {
            let expected = m.abs();
            let tolerance = 8.0 * f64::EPSILON * expected;
            assert!(
                (r * r - expected).abs() <= tolerance,
                "{r}² differs from |{m}|"
            );
        }
    }

    fn with(config: Config) -> ArlExecute {
        let arl = ArlExecute::new();
        arl.set_client(config).unwrap();
        arl
    }

    #[test]
    fn test_generic_image_workflow() {
        let arl = with(Config::deferred().with_workers(4));

        let model = arl
            .execute(create_test_image)
            .call((Value::new(TestImage::default()),))
            .unwrap();
        assert!(!model.is_ready());

        let root = generic_image_workflow(&arl, imagerooter, model.clone(), 4).unwrap();
        let (model, root) = arl.compute(&(model, root)).unwrap();
        let (model, root) = (model.unwrap(), root.unwrap());

        assert_eq!(model.npixel(), (256, 256));
        assert_rooted(&root, &model);
        // 1 model, 16 extracts, 16 stages, gather and assemble.
        assert_eq!(arl.last_diagnostics().len(), 35);
        arl.close();
    }

    #[test]
    fn test_generic_image_iterator_workflow() {
        for config in [Config::sync(), Config::deferred().with_workers(4)] {
            let arl = with(config);
            let mut image = create_test_image(&TestImage::default()).unwrap();
            image.data.mapv_inplace(|x| x.max(0.0));

            let root =
                generic_image_iterator_workflow(&arl, imagerooter, &image, image_raster_iter, 4)
                    .unwrap();
            let root = arl.compute(&root).unwrap().unwrap();

            assert_rooted(&root, &image);
            arl.close();
        }
    }

    #[test]
    fn test_zero_facets_rejected() {
        let arl = with(Config::sync());
        let image = Value::new(create_test_image(&TestImage::default()).unwrap());
        assert!(generic_image_workflow(&arl, imagerooter, image, 0).is_err());
    }

    #[test]
    fn test_generic_list_workflow() {
        struct Gain {
            factor: f64,
        }

        fn apply(data: &Vec<f64>, gain: &Gain) -> anyhow::Result<Vec<f64>> {
            Ok(data.iter().map(|x| x * gain.factor).collect())
        }

        let arl = with(Config::deferred().with_workers(2));
        let items = vec![Value::new(vec![1.0, 2.0]), Value::new(vec![3.0])];

        let gain = arl.scatter(Gain { factor: 2.0 }).unwrap();
        let out = generic_list_workflow(&arl, apply, &items, gain).unwrap();
        let out = arl.compute(&out).unwrap();

        assert_eq!(**out[0].as_ref().unwrap(), vec![2.0, 4.0]);
        assert_eq!(**out[1].as_ref().unwrap(), vec![6.0]);
    }
}
